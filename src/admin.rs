// src/admin.rs

//! HTTP surface of the pool.
//!
//! Caller-facing routes (select, status report, admission) are open; the
//! administrative CRUD routes require the configured bearer token.

use crate::error::{AppError, Result};
use crate::key_manager::OutcomeReport;
use crate::state::AppState;
use crate::storage::{AuditEntry, KeyRecord, KeyUpdate, NewKey};
use axum::{
    extract::{Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// --- Views ---

/// Operator-facing key listing entry; key material is redacted.
#[derive(Debug, Serialize)]
pub struct KeyView {
    pub key_preview: String,
    pub group: String,
    pub name: String,
    pub status: String,
    pub weight: u32,
    pub usage_count: u64,
    pub error_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: Option<i64>,
    pub in_flight: u32,
}

/// A selected key, returned with the full secret; the one place a caller
/// legitimately needs it.
#[derive(Debug, Serialize)]
pub struct SelectedKey {
    pub key: String,
    pub group: String,
    pub name: String,
    pub weight: u32,
}

impl From<KeyRecord> for SelectedKey {
    fn from(record: KeyRecord) -> Self {
        Self {
            key: record.key,
            group: record.group,
            name: record.name,
            weight: record.weight,
        }
    }
}

fn basic_view(record: &KeyRecord) -> KeyView {
    KeyView {
        key_preview: record.preview(),
        group: record.group.clone(),
        name: record.name.clone(),
        status: record.status.to_string(),
        weight: record.weight,
        usage_count: record.usage_count,
        error_count: record.error_count,
        last_used_at: record.last_used_at,
        cooldown_remaining_secs: None,
        in_flight: 0,
    }
}

// --- Requests ---

#[derive(Debug, Deserialize)]
pub struct AddKeyRequest {
    pub key: String,
    pub group: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub key: String,
    pub name: Option<String>,
    pub group: Option<String>,
    pub weight: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct KeyRef {
    pub key: String,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SelectParams {
    pub group: String,
    pub tag: Option<String>,
    pub strategy: Option<crate::config::SelectionStrategy>,
}

#[derive(Debug, Deserialize)]
pub struct StatusReportRequest {
    pub key: String,
    pub code: u16,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub key: Option<String>,
    #[serde(default = "default_audit_limit")]
    pub limit: u32,
}

fn default_audit_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub key: String,
    pub max_concurrent: Option<u32>,
    pub lease_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct AcquireResponse {
    pub lease_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub key: String,
    pub lease_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

// --- Router ---

pub fn admin_routes(state: Arc<AppState>) -> Router {
    let open = Router::new()
        .route("/api/keys/select", get(select_key))
        .route("/api/keys/status", post(report_status))
        .route("/api/admission/acquire", post(acquire_request))
        .route("/api/admission/release", post(release_request));

    let protected = Router::new()
        .route(
            "/api/keys",
            get(list_keys).post(add_key).patch(update_key).delete(delete_key),
        )
        .route("/api/keys/enable", post(enable_key))
        .route("/api/keys/disable", post(disable_key))
        .route("/api/keys/audit", get(audit_log))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    open.merge(protected).with_state(state)
}

/// Bearer-token check for administrative routes. When no token is configured
/// the routes stay open (single-operator deployments).
async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if let Some(expected) = &state.config.server.admin_token {
        let presented = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if presented != Some(expected.expose_secret().as_str()) {
            return Err(AppError::Authentication {
                message: "missing or invalid admin token".to_string(),
            });
        }
    }
    Ok(next.run(request).await)
}

// --- Handlers ---

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_keys(State(state): State<Arc<AppState>>) -> Result<Json<Vec<KeyView>>> {
    let records = state.key_manager.list_keys().await?;
    let mut views = Vec::with_capacity(records.len());
    for record in &records {
        let mut view = basic_view(record);
        view.cooldown_remaining_secs = state.cooldown.remaining_seconds(&record.key).await?;
        view.in_flight = state.limiter.in_flight(&record.key).await?;
        views.push(view);
    }
    Ok(Json(views))
}

async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddKeyRequest>,
) -> Result<(http::StatusCode, Json<KeyView>)> {
    let record = state
        .key_manager
        .add_key(NewKey {
            key: body.key,
            group: body.group,
            name: body.name,
            weight: body.weight,
        })
        .await?;
    Ok((http::StatusCode::CREATED, Json(basic_view(&record))))
}

async fn update_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateKeyRequest>,
) -> Result<Json<KeyView>> {
    let record = state
        .key_manager
        .update_key(
            &body.key,
            KeyUpdate {
                name: body.name,
                group: body.group,
                weight: body.weight,
            },
        )
        .await?;
    Ok(Json(basic_view(&record)))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeyRef>,
) -> Result<http::StatusCode> {
    state.key_manager.delete_key(&body.key).await?;
    Ok(http::StatusCode::NO_CONTENT)
}

async fn select_key(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SelectParams>,
) -> Result<Json<SelectedKey>> {
    let record = state
        .key_manager
        .get_key(&params.group, params.tag.as_deref(), params.strategy)
        .await?;
    Ok(Json(record.into()))
}

async fn report_status(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StatusReportRequest>,
) -> Result<Json<OutcomeReport>> {
    let report = state
        .key_manager
        .report_outcome(&body.key, body.code, body.note.as_deref())
        .await?;
    debug!(code = body.code, action = ?report.action, "Outcome reported");
    Ok(Json(report))
}

async fn enable_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeyRef>,
) -> Result<Json<KeyView>> {
    let record = state
        .key_manager
        .enable_key(&body.key, body.note.as_deref())
        .await?;
    Ok(Json(basic_view(&record)))
}

async fn disable_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeyRef>,
) -> Result<Json<KeyView>> {
    let record = state
        .key_manager
        .disable_key(&body.key, body.note.as_deref())
        .await?;
    Ok(Json(basic_view(&record)))
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditEntry>>> {
    let entries = state
        .key_manager
        .audit_entries(params.key.as_deref(), params.limit.min(500))
        .await?;
    Ok(Json(entries))
}

async fn acquire_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>> {
    let max = match body.max_concurrent {
        Some(max) if max > 0 => max,
        _ => state.settings.max_concurrent().await,
    };
    let lease_timeout = Duration::from_secs(
        body.lease_secs
            .unwrap_or(state.config.pool.lease_timeout_secs),
    );

    match state
        .limiter
        .try_acquire(&body.key, max, lease_timeout)
        .await?
    {
        Some(lease_id) => Ok(Json(AcquireResponse { lease_id })),
        None => Err(AppError::TooManyRequests { limit: max }),
    }
}

async fn release_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>> {
    let released = state.limiter.release(&body.key, &body.lease_id).await?;
    Ok(Json(ReleaseResponse { released }))
}

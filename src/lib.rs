// src/lib.rs

pub mod admin;
pub mod admission;
pub mod cli;
pub mod config;
pub mod cooldown;
pub mod coordination;
pub mod error;
pub mod events;
pub mod key_manager;
pub mod lock;
pub mod settings;
pub mod state;
pub mod storage;

use axum::{routing::get, Router};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use state::AppState;

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/health", get(admin::health_check))
        .merge(admin::admin_routes(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(CorsLayer::permissive()),
        )
}

/// Load configuration, wire the application state, start the background
/// sweeps and return the router alongside the state.
pub async fn run(config_path: Option<PathBuf>) -> Result<(Router, Arc<AppState>)> {
    let path = config_path.unwrap_or_else(|| PathBuf::from("config.yaml"));
    let config = config::load_config(&path)?;

    let state = Arc::new(AppState::new(&config).await?);
    state.spawn_background_tasks();

    info!(
        strategy = %config.pool.strategy,
        groups = config.groups.len(),
        "Key pool initialized"
    );

    let app = create_router(state.clone());
    Ok((app, state))
}

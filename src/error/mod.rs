//! Error handling module
//!
//! Provides the application-wide error taxonomy with:
//! - RFC 7807 Problem Details responses
//! - Proper error categorization and HTTP status mapping
//! - Structured logging of failures

pub mod types;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Standard error response format following RFC 7807 Problem Details
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// A URI reference that identifies the problem type
    #[serde(rename = "type")]
    pub error_type: String,

    /// A short, human-readable summary of the problem type
    pub title: String,

    /// The HTTP status code
    pub status: u16,

    /// A human-readable explanation specific to this occurrence
    pub detail: String,

    /// A URI reference that identifies the specific occurrence
    pub instance: String,

    /// Request ID for tracing
    pub request_id: Option<String>,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // Configuration errors
    #[error("Configuration validation failed: {message}")]
    ConfigValidation {
        message: String,
        field: Option<String>,
    },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Configuration parse error: {message}")]
    ConfigParse {
        message: String,
        line: Option<usize>,
    },

    // Coordination cache errors
    #[error("Coordination store unavailable: {message}")]
    CacheUnavailable { message: String },

    #[error("Coordination store operation failed: {operation} - {message}")]
    CacheOperation { operation: String, message: String },

    // Persistent store errors
    #[error("Database operation failed: {message}")]
    Database { message: String },

    // Key pool errors
    #[error("Lock '{name}' unavailable after {attempts} attempts")]
    LockUnavailable { name: String, attempts: u32 },

    #[error("No available key in group '{group}'")]
    NoAvailableKey { group: String },

    #[error("Too many concurrent requests for key (limit {limit})")]
    TooManyRequests { limit: u32 },

    #[error("Key not found: {key_preview}")]
    KeyNotFound { key_preview: String },

    #[error("Key already exists: {key_preview}")]
    KeyExists { key_preview: String },

    // Validation errors
    #[error("Validation failed: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // Authentication
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // System errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("IO operation failed: {operation} - {message}")]
    Io { operation: String, message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a new configuration validation error
    pub fn config_validation(message: impl Into<String>, field: Option<impl Into<String>>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            field: field.map(Into::into),
        }
    }

    /// Create a new internal error with context
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a cache operation error
    pub fn cache_op(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            Self::ConfigParse { .. }
            | Self::InvalidRequest { .. }
            | Self::Validation { .. }
            | Self::Serialization { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,

            // 404 Not Found
            Self::ConfigNotFound { .. } | Self::KeyNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            Self::KeyExists { .. } | Self::LockUnavailable { .. } => StatusCode::CONFLICT,

            // 429 Too Many Requests
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            Self::ConfigValidation { .. }
            | Self::Internal { .. }
            | Self::Database { .. }
            | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 503 Service Unavailable
            Self::NoAvailableKey { .. }
            | Self::CacheUnavailable { .. }
            | Self::CacheOperation { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error type URI for RFC 7807 compliance
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. }
            | Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. } => "https://keypool.dev/errors/configuration",
            Self::CacheUnavailable { .. } | Self::CacheOperation { .. } => {
                "https://keypool.dev/errors/coordination"
            }
            Self::Database { .. } => "https://keypool.dev/errors/storage",
            Self::LockUnavailable { .. } => "https://keypool.dev/errors/lock",
            Self::NoAvailableKey { .. } | Self::KeyNotFound { .. } | Self::KeyExists { .. } => {
                "https://keypool.dev/errors/key-pool"
            }
            Self::TooManyRequests { .. } => "https://keypool.dev/errors/admission",
            Self::Authentication { .. } => "https://keypool.dev/errors/authentication",
            Self::Validation { .. } | Self::InvalidRequest { .. } => {
                "https://keypool.dev/errors/validation"
            }
            _ => "https://keypool.dev/errors/internal",
        }
    }

    /// Get a human-readable title for the error
    pub fn title(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. }
            | Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. } => "Configuration Error",
            Self::CacheUnavailable { .. } | Self::CacheOperation { .. } => "Coordination Error",
            Self::Database { .. } => "Storage Error",
            Self::LockUnavailable { .. } => "Lock Unavailable",
            Self::NoAvailableKey { .. } => "No Available Key",
            Self::TooManyRequests { .. } => "Too Many Requests",
            Self::KeyNotFound { .. } | Self::KeyExists { .. } => "Key Pool Error",
            Self::Authentication { .. } => "Authentication Error",
            Self::Validation { .. } | Self::InvalidRequest { .. } => "Validation Error",
            _ => "Internal Server Error",
        }
    }

    /// True for errors a caller may retry after a short backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockUnavailable { .. }
                | Self::CacheUnavailable { .. }
                | Self::CacheOperation { .. }
        )
    }

    /// Log the error with appropriate level
    pub fn log(&self, request_id: Option<&str>) {
        let request_id = request_id.unwrap_or("unknown");

        match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                error!(
                    error = %self,
                    request_id = request_id,
                    error_type = self.error_type(),
                    "Application error occurred"
                );
            }
            _ => {
                warn!(
                    error = %self,
                    request_id = request_id,
                    error_type = self.error_type(),
                    "Client error occurred"
                );
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        self.log(Some(&request_id));

        let status = self.status_code();
        let error_response = ErrorResponse {
            error_type: self.error_type().to_string(),
            title: self.title().to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            instance: format!("/errors/{request_id}"),
            request_id: Some(request_id),
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for the application
pub type Result<T, E = AppError> = std::result::Result<T, E>;

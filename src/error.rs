//! Error types for the Mostrador server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
///
/// Per-event sync failures (conflict, duplicate, invalid, ignored) are
/// statuses in the push response, not errors. Only transport-level problems
/// surface here.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp parse error: {0}")]
    TimestampParse(#[from] chrono::ParseError),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serialization_error",
                    "Failed to serialize payload".to_string(),
                )
            }
            AppError::TimestampParse(e) => {
                tracing::error!("Timestamp parse error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "timestamp_error",
                    "Invalid stored timestamp".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

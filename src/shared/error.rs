//! Application Error Types
//!
//! Centralized error taxonomy shared by every transport, with Axum
//! integration for the HTTP glue.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type
///
/// Every variant maps to a stable wire code (see [`AppError::code`]) that is
/// sent back to TCP and WebSocket peers inside error replies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed client message. Reply, keep the connection open.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid or expired credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Action requires an authenticated connection.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Connection caps reached.
    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    /// Corrupt binary stream. Fatal to the offending connection.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl AppError {
    /// Stable error code sent to protocol peers
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Authentication(_) => "AUTH_FAILED",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Conflict(_) => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ResourceLimit(_) => "RESOURCE_LIMIT",
            AppError::Framing(_) => "FRAMING_ERROR",
            AppError::Backend(_) | AppError::Redis(_) => "BACKEND_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to a peer. Internal details are never leaked.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Validation(msg)
            | AppError::Authentication(msg)
            | AppError::Unauthorized(msg)
            | AppError::Conflict(msg)
            | AppError::NotFound(msg)
            | AppError::ResourceLimit(msg)
            | AppError::Framing(msg) => msg.clone(),
            AppError::Backend(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "Internal server error".into()
            }
        }
    }

    /// Whether the connection that caused this error must be closed
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Framing(_) | AppError::ResourceLimit(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication(_) | AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ResourceLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Framing(_) => StatusCode::BAD_REQUEST,
            AppError::Backend(_) | AppError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Internal(msg) | AppError::Backend(msg) => {
                tracing::error!("Internal error: {}", msg);
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
            }
            _ => {}
        }

        let body = ErrorResponse {
            code: self.code(),
            message: self.client_message(),
        };

        (self.status(), Json(body)).into_response()
    }
}

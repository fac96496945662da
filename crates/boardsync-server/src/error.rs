use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use boardsync_core::UserId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("user {user_id} already holds {limit} connections")]
    AdmissionRejected { user_id: UserId, limit: usize },
}

/// Failure writing one frame to one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The reader is gone. The connection is dead and gets removed.
    #[error("sink closed")]
    Closed,
    /// The per-connection queue is full. The reader has fallen too far
    /// behind to catch up, so the connection is removed like a closed one.
    #[error("send queue full")]
    Full,
}

/// Error surfaced by an HTTP handler, rendered as `{"error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Connection limit exceeded")]
    ConnectionLimit { retry_after_secs: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ConnectionLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        match self {
            Self::ConnectionLimit { retry_after_secs } => (
                self.status(),
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (self.status(), body).into_response(),
        }
    }
}

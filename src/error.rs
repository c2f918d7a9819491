use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy for the syncing file core (design document section 7).
///
/// Each variant maps to exactly one HTTP status in `into_response` below;
/// everything outside the named taxonomy is folded into `Internal`.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("state did not leave pending within the preparation deadline")]
    PreparationTimeout,

    #[error("no bytes flowed within the idle timeout window")]
    IdleTimeout,

    #[error("source error: {0}")]
    SourceError(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("io error: {0}")]
    IoError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::IoError(e.to_string())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            CoreError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            CoreError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            CoreError::InvalidArgument(m) => (StatusCode::BAD_REQUEST, m.clone()),
            CoreError::PreparationTimeout
            | CoreError::IdleTimeout
            | CoreError::SourceError(_)
            | CoreError::SizeMismatch { .. }
            | CoreError::ChecksumMismatch { .. }
            | CoreError::IoError(_)
            | CoreError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            CoreError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

/// Unified error types for the skystream pipeline
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Group, filter or sketch already exists (recoverable on init)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Stream entry or firehose message could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// External service (classifier, topic model, route search) failures
    #[error("External service error: {0}")]
    External(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for the "already exists" family of init errors
    pub fn is_already_exists(&self) -> bool {
        matches!(self, PipelineError::AlreadyExists(_))
    }
}

/// API error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert PipelineError to HTTP response
impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            PipelineError::Decode(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            PipelineError::External(_) | PipelineError::Http(_) => (
                StatusCode::BAD_GATEWAY,
                "UpstreamUnavailable",
                self.to_string(),
            ),
            PipelineError::Store(_) | PipelineError::Internal(_) | PipelineError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

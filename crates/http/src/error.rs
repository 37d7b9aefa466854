//! HTTP error envelope for the dashboard API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paf_core::Error as CoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the REST handlers
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// JSON body returned for every error
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            HttpError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            HttpError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            HttpError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            HttpError::InternalServerError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error")
            }
            HttpError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for HttpError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConfigMissing { .. } => HttpError::NotFound(err.to_string()),
            CoreError::ConfigInvalid { .. } => HttpError::BadRequest(err.to_string()),
            CoreError::NoUpstreamAvailable => HttpError::ServiceUnavailable(err.to_string()),
            other => HttpError::InternalServerError(other.to_string()),
        }
    }
}

/// Result type alias using HttpError
pub type Result<T> = std::result::Result<T, HttpError>;

/// Plain JSON error payload used on the proxy path, where the error shape
/// is part of the forwarding contract rather than the dashboard envelope
pub fn proxy_error_body(message: &str) -> serde_json::Value {
    json!({ "error": message })
}

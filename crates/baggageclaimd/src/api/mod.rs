//! HTTP API.

pub mod server;
mod streams;
mod volumes;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use baggageclaim::{PromiseList, VolumeRepository};
use baggageclaim_common::{ClaimError, ClaimResult, ErrorClass};
use serde_json::json;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    repo: Arc<VolumeRepository>,
    promises: Arc<PromiseList>,
}

impl AppState {
    /// Wrap a repository for the handlers.
    pub fn new(repo: VolumeRepository) -> Self {
        Self {
            repo: Arc::new(repo),
            promises: Arc::new(PromiseList::new()),
        }
    }
}

/// A non-2xx response with an `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ClaimError> for ApiError {
    fn from(err: ClaimError) -> Self {
        Self::new(status_for(&err), err.to_string())
    }
}

/// Status code for an engine error.
pub fn status_for(err: &ClaimError) -> StatusCode {
    match err {
        ClaimError::NoParentVolumeProvided
        | ClaimError::ParentVolumeNotFound { .. }
        | ClaimError::UnknownStrategy { .. }
        | ClaimError::InvalidStrategy { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ClaimError::VolumeAlreadyExists { .. } => StatusCode::CONFLICT,
        _ => match err.class() {
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::StreamLimit => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorClass::Corruption | ErrorClass::Infra | ErrorClass::Concurrency => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}

/// Run blocking repository work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> ClaimResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => {
            tracing::error!(error = %err, "Blocking task failed");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        assert_eq!(status_for(&ClaimError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ClaimError::UnsupportedEncoding {
                encoding: "br".to_string()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ClaimError::NoParentVolumeProvided),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ClaimError::StreamLimitExceeded { limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&ClaimError::VolumeCorrupted {
                handle: "x".to_string()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

//! hutchd error type and its HTTP projection.
//!
//! Everything user-facing funnels into `ApiError`, which carries the wire
//! error taxonomy from `hutch-proto` so RPC callers and HTTP status codes
//! agree on classification.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use hutch_proto::{ErrorCode, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{}", .0.message)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Validation(#[from] hutch_guard::ValidationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Wire(e) => e.code,
            ApiError::Validation(_) => ErrorCode::Validation,
            ApiError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Wire(WireError::not_found(message))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Wire(WireError::validation(message))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Wire(WireError::conflict(message))
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        ApiError::Wire(WireError::new(ErrorCode::ResourceExhausted, message))
    }

    pub fn transient_worker(message: impl Into<String>) -> Self {
        ApiError::Wire(WireError::new(ErrorCode::TransientWorker, message))
    }

    pub fn fatal_provisioning(message: impl Into<String>) -> Self {
        ApiError::Wire(WireError::new(ErrorCode::FatalProvisioning, message))
    }
}

pub fn status_of(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::TransientWorker => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::FatalProvisioning => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::UnknownMethod => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status_of(code), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_map_to_statuses() {
        assert_eq!(status_of(ErrorCode::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ErrorCode::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_of(ErrorCode::ResourceExhausted),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_of(ErrorCode::TransientWorker),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(ErrorCode::UnknownMethod), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn validation_error_classifies() {
        let err = ApiError::from(
            hutch_guard::validate_workspace_name("../x").unwrap_err(),
        );
        assert_eq!(err.code(), ErrorCode::Validation);
    }
}

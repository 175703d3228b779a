//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prism_core::FlowRejection;
use prism_transform::TransformError;
use serde::Serialize;
use std::sync::Arc;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("upload rejected: {0}")]
    Upload(FlowRejection),

    #[error("storage error: {0}")]
    Storage(#[from] prism_storage::StorageError),

    #[error(transparent)]
    Core(#[from] prism_core::Error),

    #[error(transparent)]
    Transform(#[from] TransformError),

    /// An error produced once and handed to every coalesced waiter.
    #[error(transparent)]
    Shared(Arc<ApiError>),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
            Self::Upload(rejection) => rejection.code(),
            Self::Storage(e) if e.is_not_found() => "not_found",
            Self::Storage(_) => "storage_error",
            Self::Core(e) => core_code(e),
            Self::Transform(e) => match e {
                TransformError::Request(e) => core_code(e),
                TransformError::UpstreamFetch { .. }
                | TransformError::UpstreamUnavailable { .. }
                | TransformError::SourceTooLarge { .. } => "upstream_fetch",
                TransformError::Decode(_) | TransformError::Encode(_) => "encode_failure",
                TransformError::Storage(_) => "storage_error",
                TransformError::Io(_) => "internal_error",
            },
            Self::Shared(inner) => inner.code(),
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upload(_) => StatusCode::BAD_REQUEST,
            Self::Storage(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Core(e) => core_status(e),
            Self::Transform(e) => match e {
                TransformError::Request(e) => core_status(e),
                TransformError::UpstreamFetch { status, .. } if matches!(status, 403 | 404) => {
                    StatusCode::NOT_FOUND
                }
                TransformError::UpstreamFetch { .. } | TransformError::UpstreamUnavailable { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                TransformError::SourceTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                TransformError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
                TransformError::Encode(_)
                | TransformError::Storage(_)
                | TransformError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Shared(inner) => inner.status_code(),
        }
    }
}

fn core_code(e: &prism_core::Error) -> &'static str {
    match e {
        prism_core::Error::InvalidSettings(_) => "invalid_settings",
        prism_core::Error::UnsupportedFormat(_) => "unsupported_format",
        prism_core::Error::InvalidSource(_) => "bad_request",
    }
}

fn core_status(e: &prism_core::Error) -> StatusCode {
    match e {
        prism_core::Error::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        prism_core::Error::InvalidSettings(_) | prism_core::Error::InvalidSource(_) => {
            StatusCode::BAD_REQUEST
        }
    }
}

impl From<FlowRejection> for ApiError {
    fn from(rejection: FlowRejection) -> Self {
        Self::Upload(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

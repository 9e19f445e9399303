//! HTTP error types and JSON error bodies

use crate::storage::StorageError;
use crate::tus::UploadError;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Unsupported protocol version {0:?}; this server speaks tus 1.0.0")]
    UnsupportedVersion(String),

    #[error("PATCH bodies must be application/offset+octet-stream")]
    UnsupportedMediaType,

    #[error("Missing required header {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("Listing failed: {0}")]
    Listing(StorageError),
}

impl ApiError {
    /// Stable error code for the JSON body
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Upload(e) => e.code(),
            ApiError::UnsupportedVersion(_) => "UnsupportedVersion",
            ApiError::UnsupportedMediaType => "UnsupportedMediaType",
            ApiError::MissingHeader(_) | ApiError::InvalidHeader { .. } => "InvalidRequest",
            ApiError::Listing(_) => "ListingFailed",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Upload(e) => match e {
                UploadError::InvalidSize(_)
                | UploadError::InvalidMetadata(_)
                | UploadError::UnknownPartialReference(_)
                | UploadError::InvalidRequest(_)
                | UploadError::BodyInterrupted(_) => StatusCode::BAD_REQUEST,
                UploadError::OffsetConflict { .. } => StatusCode::CONFLICT,
                UploadError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                UploadError::NotFound(_) => StatusCode::NOT_FOUND,
                UploadError::AlreadyCompleted(_) => StatusCode::GONE,
                UploadError::StorageTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
                UploadError::StorageCommitFailed(_) | UploadError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::MissingHeader(_) | ApiError::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
            ApiError::Listing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{} ({})", self, self.code());
        }
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        let mut response = (status, Json(body)).into_response();
        // Tell the client where the upload really is so it can resume.
        if let ApiError::Upload(UploadError::OffsetConflict { current, .. }) = &self {
            if let Ok(v) = HeaderValue::from_str(&current.to_string()) {
                response
                    .headers_mut()
                    .insert(super::headers::UPLOAD_OFFSET, v);
            }
        }
        response
    }
}

impl From<crate::types::IdValidationError> for ApiError {
    fn from(err: crate::types::IdValidationError) -> Self {
        ApiError::Upload(UploadError::NotFound(err.to_string()))
    }
}

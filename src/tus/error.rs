//! Upload state machine errors

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid upload size: {0}")]
    InvalidSize(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Unknown or unusable partial upload: {0}")]
    UnknownPartialReference(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The claimed offset is stale or ahead; `current` is the stored offset.
    #[error("Offset mismatch: claimed {claimed}, current {current}")]
    OffsetConflict { claimed: u64, current: u64 },

    #[error("Upload would exceed its size: {attempted} bytes (max: {limit} bytes)")]
    SizeExceeded { attempted: u64, limit: u64 },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload already completed: {0}")]
    AlreadyCompleted(String),

    /// The request body ended early. Progress up to the last part boundary is kept.
    #[error("Request body interrupted: {0}")]
    BodyInterrupted(String),

    #[error("Storage temporarily unavailable: {0}")]
    StorageTransient(String),

    #[error("Storage commit failed: {0}")]
    StorageCommitFailed(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl UploadError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidSize(_) => "InvalidSize",
            UploadError::InvalidMetadata(_) => "InvalidMetadata",
            UploadError::UnknownPartialReference(_) => "UnknownPartialReference",
            UploadError::InvalidRequest(_) => "InvalidRequest",
            UploadError::OffsetConflict { .. } => "OffsetConflict",
            UploadError::SizeExceeded { .. } => "SizeExceeded",
            UploadError::NotFound(_) => "NotFound",
            UploadError::AlreadyCompleted(_) => "AlreadyCompleted",
            UploadError::BodyInterrupted(_) => "BodyInterrupted",
            UploadError::StorageTransient(_) => "StorageTransient",
            UploadError::StorageCommitFailed(_) => "StorageCommitFailed",
            UploadError::Storage(_) => "StorageError",
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => UploadError::StorageTransient(msg),
            StorageError::CommitFailed(msg) => UploadError::StorageCommitFailed(msg),
            other => UploadError::Storage(other),
        }
    }
}

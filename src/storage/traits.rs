//! Object store adapter trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Timeout or temporary unavailability. Safe to retry idempotent calls.
    #[error("Storage temporarily unavailable: {0}")]
    Transient(String),

    /// The backend refused to assemble the session's parts.
    #[error("Commit rejected: {0}")]
    CommitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether a retry of the same idempotent call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Backend-mandated part constraints, injected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLimits {
    /// Every part except the last must be at least this large.
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,

    /// No single part may exceed this size.
    #[serde(default = "default_max_part_size")]
    pub max_part_size: u64,

    /// Highest part number the backend accepts (part numbers start at 1).
    #[serde(default = "default_max_part_count")]
    pub max_part_count: u32,
}

fn default_min_part_size() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_max_part_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_max_part_count() -> u32 {
    10_000
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            max_part_size: default_max_part_size(),
            max_part_count: default_max_part_count(),
        }
    }
}

/// An open multi-part write session on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Object key the session will produce on commit
    #[serde(rename = "Key")]
    pub key: String,
    /// Backend session token (S3 UploadId, staging directory name, ...)
    #[serde(rename = "UploadId")]
    pub token: String,
}

/// A part accepted by the backend for an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHandle {
    #[serde(rename = "PartNumber")]
    pub number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

/// One entry of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
}

/// Uniform capability surface over a multipart-capable object store.
///
/// Everything backend-specific (minimum part size, part count, key rules)
/// stays behind this trait; callers only see [`PartLimits`].
/// The trait is object-safe and is used as `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs and the health endpoint.
    fn backend_name(&self) -> &'static str;

    /// Part constraints of this backend.
    fn limits(&self) -> PartLimits;

    /// Open a multi-part write session for `key`.
    async fn open_session(&self, key: &str) -> Result<SessionHandle, StorageError>;

    /// Write part `number` of a session. Re-writing a number replaces it.
    async fn write_part(
        &self,
        session: &SessionHandle,
        number: u32,
        data: Bytes,
    ) -> Result<PartHandle, StorageError>;

    /// Server-side copy of an existing blob as part `number` of a session.
    async fn copy_part(
        &self,
        session: &SessionHandle,
        number: u32,
        source_key: &str,
    ) -> Result<PartHandle, StorageError>;

    /// Assemble the given parts, in order, into the session's object.
    async fn commit_session(
        &self,
        session: &SessionHandle,
        parts: &[PartHandle],
    ) -> Result<(), StorageError>;

    /// Discard an open session and any parts written to it.
    async fn abort_session(&self, session: &SessionHandle) -> Result<(), StorageError>;

    /// Store a small opaque blob, replacing any previous content.
    async fn put_blob(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Read a blob. Missing keys yield `StorageError::NotFound`.
    async fn get_blob(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete_blob(&self, key: &str) -> Result<(), StorageError>;

    /// List all committed blobs whose key starts with `prefix`, sorted by key.
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError>;
}

/// Check that every part but the last meets the minimum size.
///
/// Shared by the local backends so they reject the same part layouts S3 does.
pub(crate) fn check_part_sizes(parts: &[PartHandle], limits: &PartLimits) -> Result<(), StorageError> {
    if let Some((_, init)) = parts.split_last() {
        if let Some(small) = init.iter().find(|p| p.size < limits.min_part_size) {
            return Err(StorageError::CommitFailed(format!(
                "part {} is {} bytes, below the minimum of {} bytes",
                small.number, small.size, limits.min_part_size
            )));
        }
    }
    for window in parts.windows(2) {
        if window[0].number >= window[1].number {
            return Err(StorageError::CommitFailed(
                "parts are not in ascending order".to_string(),
            ));
        }
    }
    Ok(())
}

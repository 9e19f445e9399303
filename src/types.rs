//! Core types for tusgate uploads

use crate::storage::{PartHandle, SessionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Protocol version spoken on the wire
pub const TUS_VERSION: &str = "1.0.0";

/// Client-supplied metadata, kept in key order.
pub type MetaData = BTreeMap<String, String>;

/// Longest accepted upload identifier
const MAX_ID_LEN: usize = 128;

/// Errors that can occur when validating a client-supplied upload ID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct IdValidationError(String);

/// Opaque, URL-safe upload identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    /// Allocate a fresh identifier (random, never reused).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate an identifier taken from a request path.
    pub fn parse(raw: &str) -> Result<Self, IdValidationError> {
        if raw.is_empty() || raw.len() > MAX_ID_LEN {
            return Err(IdValidationError(format!(
                "Upload ID must be 1..={} characters",
                MAX_ID_LEN
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(IdValidationError(
                "Upload ID may only contain [A-Za-z0-9_-]".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bytes received but not yet large enough to be a backend part, stashed as
/// their own blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTail {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Backend coordinates of an upload's data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocator {
    /// Object key of the assembled data
    #[serde(rename = "Key")]
    pub key: String,

    /// Open multi-part session; `None` once committed
    #[serde(rename = "Session", default)]
    pub session: Option<SessionHandle>,

    /// Committed parts in byte order
    #[serde(rename = "Parts", default)]
    pub parts: Vec<PartHandle>,

    #[serde(rename = "Pending", default)]
    pub pending: Option<PendingTail>,

    /// Bumped on every pending-tail stash so each stash gets a new blob key
    #[serde(rename = "Generation", default)]
    pub generation: u64,
}

impl StorageLocator {
    /// Total bytes held by committed parts.
    pub fn parts_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Part number the next flushed part will use.
    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }
}

/// Persisted record of one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    #[serde(rename = "ID")]
    pub id: UploadId,

    /// Declared length; `None` while deferred
    #[serde(rename = "Size")]
    pub size: Option<u64>,

    #[serde(rename = "Offset")]
    pub offset: u64,

    #[serde(rename = "MetaData", default)]
    pub metadata: MetaData,

    #[serde(rename = "IsPartial", default)]
    pub is_partial: bool,

    #[serde(rename = "IsFinal", default)]
    pub is_final: bool,

    /// IDs of the partial uploads a final upload was assembled from, in order
    #[serde(rename = "PartialUploads", default)]
    pub partial_uploads: Vec<UploadId>,

    #[serde(rename = "Storage")]
    pub storage: StorageLocator,

    #[serde(rename = "Completed", default)]
    pub completed: bool,

    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}

/// Lifecycle position derived from an [`UploadInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// No bytes received yet
    Created,
    /// Some bytes received, more expected
    Receiving,
    /// All bytes received but the backend commit has not succeeded yet
    Finalizing,
    Completed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Created => "created",
            UploadState::Receiving => "receiving",
            UploadState::Finalizing => "finalizing",
            UploadState::Completed => "completed",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UploadInfo {
    /// Fresh record with nothing received.
    pub fn new(id: UploadId, size: Option<u64>, metadata: MetaData) -> Self {
        let key = id.as_str().to_string();
        Self {
            id,
            size,
            offset: 0,
            metadata,
            is_partial: false,
            is_final: false,
            partial_uploads: Vec::new(),
            storage: StorageLocator {
                key,
                ..StorageLocator::default()
            },
            completed: false,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> UploadState {
        if self.completed {
            UploadState::Completed
        } else if self.size == Some(self.offset) {
            UploadState::Finalizing
        } else if self.offset == 0 {
            UploadState::Created
        } else {
            UploadState::Receiving
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.size.is_none()
    }

    /// Display name from the `filename` metadata entry.
    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").map(String::as_str)
    }

    /// When an incomplete upload expires under the given policy.
    pub fn expires_at(&self, expiry: Option<Duration>) -> Option<DateTime<Utc>> {
        if self.completed {
            return None;
        }
        let expiry = chrono::Duration::from_std(expiry?).ok()?;
        self.created_at.checked_add_signed(expiry)
    }

    /// Offset as implied by the locator: committed parts plus the pending tail.
    pub fn stored_bytes(&self) -> u64 {
        self.storage.parts_size() + self.storage.pending.as_ref().map_or(0, |p| p.size)
    }
}

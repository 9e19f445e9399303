//! Durable `UploadInfo` records, stored as JSON blobs next to the data

use crate::storage::{ObjectStore, StorageError};
use crate::types::{UploadId, UploadInfo};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Suffix of upload info blobs
pub const INFO_SUFFIX: &str = ".info";

/// Suffix of pending-tail blobs
pub const PART_SUFFIX: &str = ".part";

pub fn info_key(id: &UploadId) -> String {
    format!("{}{}", id, INFO_SUFFIX)
}

/// Key of the pending tail for one stash generation.
pub fn pending_key(id: &UploadId, generation: u64) -> String {
    format!("{}.{}{}", id, generation, PART_SUFFIX)
}

/// Whether a key holds bookkeeping rather than upload data.
pub fn is_internal_key(key: &str) -> bool {
    key.ends_with(INFO_SUFFIX) || key.ends_with(PART_SUFFIX)
}

/// Persistence for `UploadInfo` with overwrite semantics
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn ObjectStore>,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Write the record, replacing any previous version. Durable on return.
    #[instrument(skip(self, info), fields(id = %info.id, offset = info.offset))]
    pub async fn put(&self, info: &UploadInfo) -> Result<(), StorageError> {
        let data = serde_json::to_vec(info)?;
        self.store.put_blob(&info_key(&info.id), Bytes::from(data)).await?;
        debug!("Persisted upload info for {}", info.id);
        Ok(())
    }

    pub async fn get(&self, id: &UploadId) -> Result<UploadInfo, StorageError> {
        let data = self.store.get_blob(&info_key(id)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn delete(&self, id: &UploadId) -> Result<(), StorageError> {
        self.store.delete_blob(&info_key(id)).await
    }

    /// IDs of every stored record, sorted.
    pub async fn list_ids(&self) -> Result<Vec<UploadId>, StorageError> {
        Ok(self
            .store
            .list_blobs("")
            .await?
            .into_iter()
            .filter_map(|entry| {
                let raw = entry.key.strip_suffix(INFO_SUFFIX)?;
                UploadId::parse(raw).ok()
            })
            .collect())
    }
}

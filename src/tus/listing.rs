//! File listing with display names resolved from upload metadata

use super::info_store::{is_internal_key, INFO_SUFFIX};
use crate::storage::{ObjectStore, StorageError};
use crate::types::MetaData;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One listed data object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub key: String,
    pub name: String,
    pub size: u64,
    pub url: String,
}

/// Only the part of an info record the listing needs. Records written by
/// other tools parse as long as they carry `MetaData`.
#[derive(Deserialize)]
struct InfoMetaData {
    #[serde(rename = "MetaData", default)]
    metadata: MetaData,
}

/// List every data object, skipping bookkeeping blobs. A missing or
/// unreadable info record falls back to the raw key as the name.
pub async fn list_files(
    store: &dyn ObjectStore,
    base_url: Option<&str>,
) -> Result<Vec<FileEntry>, StorageError> {
    let blobs = store.list_blobs("").await?;
    let mut entries = Vec::with_capacity(blobs.len());

    for blob in blobs.into_iter().filter(|b| !is_internal_key(&b.key)) {
        let name = display_name(store, &blob.key)
            .await
            .unwrap_or_else(|| blob.key.clone());
        let url = match base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), blob.key),
            None => blob.key.clone(),
        };
        entries.push(FileEntry {
            key: blob.key,
            name,
            size: blob.size,
            url,
        });
    }
    debug!("Listed {} files", entries.len());
    Ok(entries)
}

async fn display_name(store: &dyn ObjectStore, key: &str) -> Option<String> {
    let raw = store
        .get_blob(&format!("{}{}", key, INFO_SUFFIX))
        .await
        .ok()?;
    match serde_json::from_slice::<InfoMetaData>(&raw) {
        Ok(info) => info.metadata.get("filename").cloned(),
        Err(e) => {
            debug!("Unreadable info for {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, PartLimits};
    use bytes::Bytes;

    async fn put(store: &MemoryStore, key: &str, data: &'static [u8]) {
        store.put_blob(key, Bytes::from_static(data)).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolves_filename_and_hides_info_blobs() {
        let store = MemoryStore::new(PartLimits::default());
        put(&store, "song.bin", b"0123456789").await;
        put(
            &store,
            "song.bin.info",
            br#"{"MetaData":{"filename":"My Song.mp3"}}"#,
        )
        .await;

        let files = list_files(&store, Some("http://localhost:9000/tusd/"))
            .await
            .unwrap();
        assert_eq!(
            files,
            vec![FileEntry {
                key: "song.bin".to_string(),
                name: "My Song.mp3".to_string(),
                size: 10,
                url: "http://localhost:9000/tusd/song.bin".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_key() {
        let store = MemoryStore::new(PartLimits::default());
        put(&store, "a", b"x").await;
        put(&store, "b", b"y").await;
        put(&store, "b.info", b"not json").await;
        put(&store, "c", b"z").await;
        put(&store, "c.info", br#"{"MetaData":{"type":"text"}}"#).await;
        put(&store, "d.3.part", b"tail").await;

        let files = list_files(&store, None).await.unwrap();
        let names: Vec<(&str, &str)> = files
            .iter()
            .map(|f| (f.key.as_str(), f.name.as_str()))
            .collect();
        assert_eq!(names, vec![("a", "a"), ("b", "b"), ("c", "c")]);
        assert_eq!(files[0].url, "a");
    }
}

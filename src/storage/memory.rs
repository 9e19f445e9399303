//! In-memory object store
//!
//! Used by the test suites and for throwaway deployments. Sessions and blobs
//! live in process memory and are lost on restart.

use super::traits::{
    check_part_sizes, BlobEntry, ObjectStore, PartHandle, PartLimits, SessionHandle, StorageError,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Parts of one open session, keyed by part number
struct OpenSession {
    key: String,
    parts: HashMap<u32, Bytes>,
}

/// Thread-safe in-memory store
pub struct MemoryStore {
    limits: PartLimits,
    blobs: RwLock<BTreeMap<String, Bytes>>,
    sessions: RwLock<HashMap<String, OpenSession>>,
    session_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new(limits: PartLimits) -> Self {
        Self {
            limits,
            blobs: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
        }
    }

    /// Number of sessions that are neither committed nor aborted.
    pub fn open_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn part_etag(data: &[u8]) -> String {
        format!("\"{}\"", hex::encode(Md5::digest(data)))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn limits(&self) -> PartLimits {
        self.limits
    }

    async fn open_session(&self, key: &str) -> Result<SessionHandle, StorageError> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        let token = format!("mem-{:08x}", n);
        self.sessions.write().insert(
            token.clone(),
            OpenSession {
                key: key.to_string(),
                parts: HashMap::new(),
            },
        );
        Ok(SessionHandle {
            key: key.to_string(),
            token,
        })
    }

    async fn write_part(
        &self,
        session: &SessionHandle,
        number: u32,
        data: Bytes,
    ) -> Result<PartHandle, StorageError> {
        if number == 0 || number > self.limits.max_part_count {
            return Err(StorageError::Other(format!(
                "part number {} outside 1..={}",
                number, self.limits.max_part_count
            )));
        }
        let size = data.len() as u64;
        let etag = Self::part_etag(&data);

        let mut sessions = self.sessions.write();
        let open = sessions
            .get_mut(&session.token)
            .filter(|s| s.key == session.key)
            .ok_or_else(|| StorageError::NotFound(format!("session {}", session.token)))?;
        open.parts.insert(number, data);

        Ok(PartHandle { number, etag, size })
    }

    async fn copy_part(
        &self,
        session: &SessionHandle,
        number: u32,
        source_key: &str,
    ) -> Result<PartHandle, StorageError> {
        let data = self.get_blob(source_key).await?;
        self.write_part(session, number, data).await
    }

    async fn commit_session(
        &self,
        session: &SessionHandle,
        parts: &[PartHandle],
    ) -> Result<(), StorageError> {
        check_part_sizes(parts, &self.limits)?;

        let assembled = {
            let sessions = self.sessions.read();
            let open = sessions
                .get(&session.token)
                .filter(|s| s.key == session.key)
                .ok_or_else(|| StorageError::NotFound(format!("session {}", session.token)))?;

            let mut assembled = BytesMut::new();
            for part in parts {
                let data = open.parts.get(&part.number).ok_or_else(|| {
                    StorageError::CommitFailed(format!("part {} was never written", part.number))
                })?;
                if Self::part_etag(data) != part.etag {
                    return Err(StorageError::CommitFailed(format!(
                        "ETag mismatch for part {}",
                        part.number
                    )));
                }
                assembled.extend_from_slice(data);
            }
            assembled.freeze()
        };

        self.blobs.write().insert(session.key.clone(), assembled);
        self.sessions.write().remove(&session.token);
        Ok(())
    }

    async fn abort_session(&self, session: &SessionHandle) -> Result<(), StorageError> {
        self.sessions.write().remove(&session.token);
        Ok(())
    }

    async fn put_blob(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.blobs.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Bytes, StorageError> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_blob(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.write().remove(key);
        Ok(())
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| BlobEntry {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }
}

//! Filesystem-based object store
//!
//! Storage layout:
//! ```text
//! {root}/
//!   {key}                          # committed objects and small blobs
//!   .sessions/{token}/{n:05}.part  # parts of an open multi-part session
//! ```
//!
//! Committing a session concatenates its parts into a temp file next to the
//! target and renames it into place, so a reader never sees a half-written
//! object.

use super::traits::{
    check_part_sizes, BlobEntry, ObjectStore, PartHandle, PartLimits, SessionHandle, StorageError,
};
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, instrument};

const SESSIONS_DIR: &str = ".sessions";

/// Async-safe path existence check (avoids blocking the Tokio runtime)
async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

/// Convert an io::Error into StorageError. A full disk may clear up, so it
/// is reported as transient.
fn io_to_storage_error(e: std::io::Error) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        StorageError::Transient(format!("disk full: {}", e))
    } else {
        StorageError::Io(e)
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Other(format!("spawn_blocking join failed: {}", e))
}

/// Atomically write data to a file using write-to-temp + fsync + rename.
async fn atomic_write(path: &Path, data: Bytes) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Other("Cannot atomic-write to a path with no parent".into()))?
        .to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent).map_err(io_to_storage_error)?;
        tmp.write_all(&data).map_err(io_to_storage_error)?;
        tmp.as_file().sync_all().map_err(io_to_storage_error)?;
        tmp.persist(&path)
            .map_err(|e| io_to_storage_error(e.error))?;
        Ok(())
    })
    .await
    .map_err(join_error)?
}

/// Quoted hex MD5 of a file's content, read in blocks.
fn file_etag(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("\"{}\"", hex::encode(hasher.finalize())), total))
}

/// Filesystem object store
pub struct FilesystemStore {
    /// Root directory for all data
    root: PathBuf,
    limits: PartLimits,
}

impl FilesystemStore {
    /// Create a new filesystem store rooted at `root`, creating it if needed.
    pub async fn new(root: PathBuf, limits: PartLimits) -> Result<Self, StorageError> {
        fs::create_dir_all(root.join(SESSIONS_DIR))
            .await
            .map_err(io_to_storage_error)?;
        Ok(Self { root, limits })
    }

    /// Resolve a key to a path under the root, rejecting keys that could
    /// escape it or collide with session staging.
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !key.starts_with(SESSIONS_DIR);
        if !valid {
            return Err(StorageError::Other(format!("invalid object key: {:?}", key)));
        }
        Ok(self.root.join(relative))
    }

    fn session_dir(&self, session: &SessionHandle) -> Result<PathBuf, StorageError> {
        if session.token.is_empty() || !session.token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::Other(format!(
                "invalid session token: {:?}",
                session.token
            )));
        }
        Ok(self.root.join(SESSIONS_DIR).join(&session.token))
    }

    async fn existing_session_dir(&self, session: &SessionHandle) -> Result<PathBuf, StorageError> {
        let dir = self.session_dir(session)?;
        if !path_exists(&dir).await {
            return Err(StorageError::NotFound(format!("session {}", session.token)));
        }
        Ok(dir)
    }

    fn part_path(dir: &Path, number: u32) -> PathBuf {
        dir.join(format!("{:05}.part", number))
    }

    fn check_part_number(&self, number: u32) -> Result<(), StorageError> {
        if number == 0 || number > self.limits.max_part_count {
            return Err(StorageError::Other(format!(
                "part number {} outside 1..={}",
                number, self.limits.max_part_count
            )));
        }
        Ok(())
    }

    /// Recursively collect regular files below `dir`, skipping staging and
    /// temp files.
    fn walk<'a>(
        root: &'a Path,
        dir: &'a Path,
        results: &'a mut Vec<BlobEntry>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(true, |n| n.starts_with('.'));
                if hidden {
                    continue;
                }
                let ft = entry.file_type().await?;
                if ft.is_dir() {
                    Self::walk(root, &path, results).await?;
                } else if ft.is_file() {
                    if let Ok(relative) = path.strip_prefix(root) {
                        let key = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        results.push(BlobEntry {
                            key,
                            size: entry.metadata().await?.len(),
                        });
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    fn limits(&self) -> PartLimits {
        self.limits
    }

    #[instrument(skip(self))]
    async fn open_session(&self, key: &str) -> Result<SessionHandle, StorageError> {
        self.object_path(key)?;
        let session = SessionHandle {
            key: key.to_string(),
            token: uuid::Uuid::new_v4().simple().to_string(),
        };
        fs::create_dir_all(self.session_dir(&session)?)
            .await
            .map_err(io_to_storage_error)?;
        debug!("Opened staging session {} for {}", session.token, key);
        Ok(session)
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn write_part(
        &self,
        session: &SessionHandle,
        number: u32,
        data: Bytes,
    ) -> Result<PartHandle, StorageError> {
        self.check_part_number(number)?;
        let dir = self.existing_session_dir(session).await?;
        let size = data.len() as u64;
        let etag = format!("\"{}\"", hex::encode(Md5::digest(&data)));
        atomic_write(&Self::part_path(&dir, number), data).await?;
        debug!("Wrote part {} of {} ({} bytes)", number, session.key, size);
        Ok(PartHandle { number, etag, size })
    }

    #[instrument(skip(self))]
    async fn copy_part(
        &self,
        session: &SessionHandle,
        number: u32,
        source_key: &str,
    ) -> Result<PartHandle, StorageError> {
        self.check_part_number(number)?;
        let dir = self.existing_session_dir(session).await?;
        let source = self.object_path(source_key)?;
        if !path_exists(&source).await {
            return Err(StorageError::NotFound(source_key.to_string()));
        }
        let target = Self::part_path(&dir, number);

        let (etag, size) = tokio::task::spawn_blocking(move || {
            let tmp = NamedTempFile::new_in(&dir).map_err(io_to_storage_error)?;
            std::fs::copy(&source, tmp.path()).map_err(io_to_storage_error)?;
            tmp.as_file().sync_all().map_err(io_to_storage_error)?;
            let etag = file_etag(tmp.path()).map_err(io_to_storage_error)?;
            tmp.persist(&target)
                .map_err(|e| io_to_storage_error(e.error))?;
            Ok::<_, StorageError>(etag)
        })
        .await
        .map_err(join_error)??;

        Ok(PartHandle { number, etag, size })
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn commit_session(
        &self,
        session: &SessionHandle,
        parts: &[PartHandle],
    ) -> Result<(), StorageError> {
        check_part_sizes(parts, &self.limits)?;
        let dir = self.existing_session_dir(session).await?;
        let target = self.object_path(&session.key)?;
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Other("object path has no parent".into()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(io_to_storage_error)?;

        let sources: Vec<(PathBuf, PartHandle)> = parts
            .iter()
            .map(|p| (Self::part_path(&dir, p.number), p.clone()))
            .collect();

        tokio::task::spawn_blocking(move || {
            let mut tmp = NamedTempFile::new_in(&parent).map_err(io_to_storage_error)?;
            for (path, part) in &sources {
                let mut file = std::fs::File::open(path).map_err(|_| {
                    StorageError::CommitFailed(format!("part {} was never written", part.number))
                })?;
                let copied = std::io::copy(&mut file, &mut tmp).map_err(io_to_storage_error)?;
                if copied != part.size {
                    return Err(StorageError::CommitFailed(format!(
                        "part {} is {} bytes on disk, expected {}",
                        part.number, copied, part.size
                    )));
                }
            }
            tmp.as_file().sync_all().map_err(io_to_storage_error)?;
            tmp.persist(&target)
                .map_err(|e| io_to_storage_error(e.error))?;
            Ok(())
        })
        .await
        .map_err(join_error)??;

        fs::remove_dir_all(&dir).await.map_err(io_to_storage_error)?;
        debug!("Committed session {} into {}", session.token, session.key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_session(&self, session: &SessionHandle) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.session_dir(session)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_to_storage_error(e)),
        }
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put_blob(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(io_to_storage_error)?;
        }
        atomic_write(&path, data).await
    }

    #[instrument(skip(self))]
    async fn get_blob(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(io_to_storage_error(e)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_blob(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_to_storage_error(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let mut results = Vec::new();
        Self::walk(&self.root, &self.root, &mut results).await?;
        results.retain(|e| e.key.starts_with(prefix));
        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }
}

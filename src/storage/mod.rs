//! Object store adapters

mod filesystem;
mod memory;
pub mod retry;
mod s3;
mod traits;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub(crate) use retry::duration_str;
pub use retry::RetryPolicy;
pub use s3::S3Store;
pub use traits::{BlobEntry, ObjectStore, PartHandle, PartLimits, SessionHandle, StorageError};

use crate::config::BackendConfig;
use std::sync::Arc;

/// Build the configured object store.
pub async fn build_store(
    backend: &BackendConfig,
    limits: PartLimits,
    retry: RetryPolicy,
) -> Result<Arc<dyn ObjectStore>, StorageError> {
    Ok(match backend {
        BackendConfig::Filesystem { path } => {
            Arc::new(FilesystemStore::new(path.clone(), limits).await?)
        }
        BackendConfig::S3 { .. } => Arc::new(S3Store::new(backend, limits, retry)?),
        BackendConfig::Memory => Arc::new(MemoryStore::new(limits)),
    })
}

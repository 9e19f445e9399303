//! Upload session state machine
//!
//! Every transition that reads and then rewrites an `UploadInfo` runs under
//! the upload's registry lock. Query and listing read without locking.

use super::assembler::PartAssembler;
use super::error::UploadError;
use super::info_store::{pending_key, MetadataStore};
use super::registry::SessionRegistry;
use crate::storage::{ObjectStore, PartHandle, SessionHandle, StorageError};
use crate::types::{MetaData, PendingTail, UploadId, UploadInfo};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Request body as a stream of chunks
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Longest accepted metadata key
const MAX_METADATA_KEY_LEN: usize = 256;

/// Server-side policy for the state machine
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Largest size a client may declare
    pub max_upload_size: Option<u64>,
    /// Incomplete uploads older than this are eligible for the expiry sweep
    pub upload_expiry: Option<Duration>,
}

/// Concatenation role requested at creation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Concat {
    #[default]
    None,
    Partial,
    /// Assemble the listed, completed partial uploads in order
    Final(Vec<UploadId>),
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Declared length, or `None` when deferred
    pub size: Option<u64>,
    pub metadata: MetaData,
    pub concat: Concat,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    /// Offset the client believes the upload is at
    pub offset: u64,
    /// `Upload-Length` sent with the append, for deferred uploads
    pub declare_size: Option<u64>,
    /// Body length when known up front
    pub content_length: Option<u64>,
}

/// Outcome of a successful append
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub offset: u64,
    pub completed: bool,
    pub bytes_received: u64,
    pub parts_written: usize,
}

/// The protocol core: create, query, append, finalize, delete.
pub struct UploadEngine {
    store: Arc<dyn ObjectStore>,
    infos: MetadataStore,
    registry: SessionRegistry,
    options: EngineOptions,
}

fn validate_metadata(metadata: &MetaData) -> Result<(), UploadError> {
    for key in metadata.keys() {
        if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
            return Err(UploadError::InvalidMetadata(format!(
                "metadata key must be 1..={} bytes",
                MAX_METADATA_KEY_LEN
            )));
        }
        if !key.chars().all(|c| c.is_ascii_graphic() && c != ',') {
            return Err(UploadError::InvalidMetadata(format!(
                "metadata key {:?} must be printable ASCII without spaces or commas",
                key
            )));
        }
    }
    Ok(())
}

/// Map a missing info record to `NotFound` for the given ID.
fn not_found(id: &UploadId) -> impl FnOnce(StorageError) -> UploadError + '_ {
    move |e| match e {
        StorageError::NotFound(_) => UploadError::NotFound(id.to_string()),
        other => other.into(),
    }
}

impl UploadEngine {
    pub fn new(store: Arc<dyn ObjectStore>, options: EngineOptions) -> Self {
        Self {
            infos: MetadataStore::new(store.clone()),
            store,
            registry: SessionRegistry::new(),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn infos(&self) -> &MetadataStore {
        &self.infos
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Create a new upload. Zero-size and final (concatenated) uploads are
    /// completed before this returns.
    #[instrument(skip(self, request), fields(size = ?request.size))]
    pub async fn create(&self, request: CreateRequest) -> Result<UploadInfo, UploadError> {
        validate_metadata(&request.metadata)?;

        let id = UploadId::generate();
        let mut upload = UploadInfo::new(id, request.size, request.metadata);

        match request.concat {
            Concat::Final(partials) => {
                if request.size.is_some() {
                    return Err(UploadError::InvalidSize(
                        "a final upload's length is the sum of its partial uploads".into(),
                    ));
                }
                self.assemble_final(&mut upload, partials).await?;
                info!(
                    "Created final upload {} from {} partial uploads ({} bytes)",
                    upload.id,
                    upload.partial_uploads.len(),
                    upload.offset
                );
                return Ok(upload);
            }
            Concat::Partial => upload.is_partial = true,
            Concat::None => {}
        }

        if let (Some(size), Some(max)) = (request.size, self.options.max_upload_size) {
            if size > max {
                return Err(UploadError::SizeExceeded {
                    attempted: size,
                    limit: max,
                });
            }
        }

        let session = self.store.open_session(&upload.storage.key).await?;

        if request.size == Some(0) {
            self.store.commit_session(&session, &[]).await?;
            upload.completed = true;
        } else {
            upload.storage.session = Some(session.clone());
        }

        if let Err(e) = self.infos.put(&upload).await {
            if !upload.completed {
                self.abort_best_effort(&session).await;
            }
            return Err(e.into());
        }

        info!(
            "Created upload {} (size: {:?}, partial: {})",
            upload.id, upload.size, upload.is_partial
        );
        Ok(upload)
    }

    /// Build a final upload from the data of its partial uploads, in order.
    async fn assemble_final(
        &self,
        upload: &mut UploadInfo,
        partials: Vec<UploadId>,
    ) -> Result<(), UploadError> {
        if partials.is_empty() {
            return Err(UploadError::InvalidRequest(
                "a final upload must reference at least one partial upload".into(),
            ));
        }
        if partials.len() > self.store.limits().max_part_count as usize {
            return Err(UploadError::InvalidRequest(format!(
                "at most {} partial uploads can be concatenated",
                self.store.limits().max_part_count
            )));
        }

        let mut total = 0u64;
        let mut sources = Vec::with_capacity(partials.len());
        for id in &partials {
            let partial = match self.infos.get(id).await {
                Ok(info) => info,
                Err(StorageError::NotFound(_)) => {
                    return Err(UploadError::UnknownPartialReference(id.to_string()))
                }
                Err(e) => return Err(e.into()),
            };
            if !partial.is_partial {
                return Err(UploadError::UnknownPartialReference(format!(
                    "{} is not a partial upload",
                    id
                )));
            }
            if !partial.completed {
                return Err(UploadError::UnknownPartialReference(format!(
                    "{} is not completed",
                    id
                )));
            }
            total += partial.offset;
            sources.push(partial);
        }
        if let Some(max) = self.options.max_upload_size {
            if total > max {
                return Err(UploadError::SizeExceeded {
                    attempted: total,
                    limit: max,
                });
            }
        }

        let session = self.store.open_session(&upload.storage.key).await?;
        let parts = match self.concat_parts(&session, &sources).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_best_effort(&session).await;
                return Err(e);
            }
        };
        if let Err(e) = self.store.commit_session(&session, &parts).await {
            self.abort_best_effort(&session).await;
            return Err(e.into());
        }

        upload.is_final = true;
        upload.size = Some(total);
        upload.offset = total;
        upload.partial_uploads = partials;
        upload.storage.parts = parts;
        upload.completed = true;
        self.infos.put(upload).await?;
        Ok(())
    }

    /// Write the partials' data as the parts of `session`.
    ///
    /// A partial is copied server-side when it can stand as a part on its
    /// own: nothing is buffered ahead of it and it meets the minimum part
    /// size or is the last one. Smaller partials are read back and merged
    /// through an assembler so every non-final part stays above the minimum.
    async fn concat_parts(
        &self,
        session: &SessionHandle,
        sources: &[UploadInfo],
    ) -> Result<Vec<PartHandle>, UploadError> {
        let min_part_size = self.store.limits().min_part_size;
        let mut parts: Vec<PartHandle> = Vec::new();
        let mut carry = Bytes::new();

        for (i, partial) in sources.iter().enumerate() {
            if partial.offset == 0 {
                continue;
            }
            let last = i + 1 == sources.len();
            if carry.is_empty() && (last || partial.offset >= min_part_size) {
                let number = parts.len() as u32 + 1;
                let part = self
                    .store
                    .copy_part(session, number, &partial.storage.key)
                    .await?;
                parts.push(part);
                continue;
            }

            let data = self.store.get_blob(&partial.storage.key).await?;
            let mut assembler = PartAssembler::new(self.store.as_ref(), session, &parts, carry);
            assembler.push(data).await?;
            let assembled = assembler.finish();
            debug!(
                "Merged partial {} into final upload ({} parts written)",
                partial.id,
                assembled.parts.len()
            );
            parts.extend(assembled.parts);
            carry = assembled.remainder;
        }

        if !carry.is_empty() {
            let mut assembler = PartAssembler::new(self.store.as_ref(), session, &parts, carry);
            assembler.flush_tail().await?;
            parts.extend(assembler.finish().parts);
        }
        Ok(parts)
    }

    /// Current state of an upload. Takes no lock.
    pub async fn query(&self, id: &UploadId) -> Result<UploadInfo, UploadError> {
        self.infos.get(id).await.map_err(not_found(id))
    }

    /// Append a request body at the claimed offset.
    ///
    /// Runs on its own task: if the caller is dropped mid-request the
    /// transition still either completes or leaves the record untouched.
    pub async fn append(
        self: &Arc<Self>,
        id: UploadId,
        request: AppendRequest,
        body: BodyStream,
    ) -> Result<AppendOutcome, UploadError> {
        let engine = self.clone();
        tokio::spawn(async move { engine.append_locked(&id, request, body).await })
            .await
            .map_err(|e| UploadError::Storage(StorageError::Other(format!("append task failed: {}", e))))?
    }

    #[instrument(skip(self, request, body), fields(id = %id, offset = request.offset))]
    async fn append_locked(
        &self,
        id: &UploadId,
        request: AppendRequest,
        mut body: BodyStream,
    ) -> Result<AppendOutcome, UploadError> {
        let _guard = self.registry.lock(id.as_str()).await;
        let mut upload = self.infos.get(id).await.map_err(not_found(id))?;

        if upload.completed {
            return Err(UploadError::AlreadyCompleted(id.to_string()));
        }
        if request.offset != upload.offset {
            return Err(UploadError::OffsetConflict {
                claimed: request.offset,
                current: upload.offset,
            });
        }

        let mut size_declared = false;
        if let Some(declared) = request.declare_size {
            match upload.size {
                Some(size) if size == declared => {}
                Some(size) => {
                    return Err(UploadError::InvalidRequest(format!(
                        "Upload-Length is already set to {}",
                        size
                    )))
                }
                None => {
                    if declared < upload.offset {
                        return Err(UploadError::InvalidSize(format!(
                            "declared length {} is below the current offset {}",
                            declared, upload.offset
                        )));
                    }
                    if let Some(max) = self.options.max_upload_size {
                        if declared > max {
                            return Err(UploadError::SizeExceeded {
                                attempted: declared,
                                limit: max,
                            });
                        }
                    }
                    upload.size = Some(declared);
                    size_declared = true;
                }
            }
        }

        let ceiling = upload.size.or(self.options.max_upload_size);
        if let (Some(limit), Some(len)) = (ceiling, request.content_length) {
            let attempted = upload.offset + len;
            if attempted > limit {
                return Err(UploadError::SizeExceeded { attempted, limit });
            }
        }

        let session = upload.storage.session.clone().ok_or_else(|| {
            UploadError::Storage(StorageError::Other(format!(
                "upload {} has no open session",
                id
            )))
        })?;
        let pending = match &upload.storage.pending {
            Some(tail) => self.store.get_blob(&tail.key).await?,
            None => Bytes::new(),
        };

        let mut assembler = PartAssembler::new(
            self.store.as_ref(),
            &session,
            &upload.storage.parts,
            pending,
        )
        .with_size(upload.size, self.options.max_upload_size);

        let start = upload.offset;
        let mut interrupted = None;
        while let Some(frame) = body.next().await {
            match frame {
                Ok(chunk) => assembler.push(chunk).await?,
                Err(e) => {
                    interrupted = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = interrupted {
            let flushed = assembler.flushed_offset();
            let assembled = assembler.finish();
            if !assembled.parts.is_empty() {
                // Only the flushed parts survive; a length declared by this
                // request is not recorded.
                if size_declared {
                    upload.size = None;
                }
                let old_tail = upload.storage.pending.take();
                upload.storage.parts.extend(assembled.parts);
                upload.offset = flushed;
                self.infos.put(&upload).await?;
                self.delete_tail_best_effort(old_tail).await;
                warn!(
                    "Body of {} interrupted; kept {} bytes up to the last part boundary",
                    id, flushed
                );
            }
            return Err(UploadError::BodyInterrupted(e.to_string()));
        }

        let new_offset = assembler.offset();
        let received = new_offset - start;
        let assembled = assembler.finish();
        let parts_written = assembled.parts.len();

        if received > 0 || size_declared {
            let old_tail = upload.storage.pending.clone();
            let tail_changed = received > 0;
            if tail_changed {
                upload.storage.pending = self.stash_tail(&mut upload, assembled.remainder).await?;
                upload.storage.parts.extend(assembled.parts);
            }
            upload.offset = new_offset;

            if let Err(e) = self.infos.put(&upload).await {
                if tail_changed {
                    self.delete_tail_best_effort(upload.storage.pending.take())
                        .await;
                }
                return Err(e.into());
            }
            if tail_changed {
                self.delete_tail_best_effort(old_tail).await;
            }
            debug!(
                "Upload {} advanced {} -> {} ({} parts written)",
                id, start, new_offset, parts_written
            );
        }

        if upload.size == Some(upload.offset) {
            self.finalize_locked(&mut upload).await?;
        }

        Ok(AppendOutcome {
            offset: upload.offset,
            completed: upload.completed,
            bytes_received: received,
            parts_written,
        })
    }

    /// Store the unflushed remainder under a fresh generation key.
    async fn stash_tail(
        &self,
        upload: &mut UploadInfo,
        remainder: Bytes,
    ) -> Result<Option<PendingTail>, UploadError> {
        if remainder.is_empty() {
            return Ok(None);
        }
        upload.storage.generation += 1;
        let tail = PendingTail {
            key: pending_key(&upload.id, upload.storage.generation),
            size: remainder.len() as u64,
        };
        self.store.put_blob(&tail.key, remainder).await?;
        Ok(Some(tail))
    }

    /// Commit an upload whose offset has reached its size. The caller holds
    /// the upload's lock.
    #[instrument(skip(self, upload), fields(id = %upload.id))]
    async fn finalize_locked(&self, upload: &mut UploadInfo) -> Result<(), UploadError> {
        if upload.completed {
            return Ok(());
        }
        let session = upload.storage.session.clone().ok_or_else(|| {
            UploadError::Storage(StorageError::Other(format!(
                "upload {} has no open session",
                upload.id
            )))
        })?;

        let mut parts = upload.storage.parts.clone();
        if let Some(tail) = &upload.storage.pending {
            let data = self.store.get_blob(&tail.key).await?;
            let mut assembler = PartAssembler::new(self.store.as_ref(), &session, &parts, data);
            assembler.flush_tail().await?;
            parts.extend(assembler.finish().parts);
        }

        if let Err(e) = self.store.commit_session(&session, &parts).await {
            if !(matches!(e, StorageError::NotFound(_)) && self.data_exists(upload).await) {
                warn!("Commit of {} failed, upload stays open: {}", upload.id, e);
                return Err(e.into());
            }
            debug!("Session of {} already committed", upload.id);
        }

        let old_tail = upload.storage.pending.take();
        upload.storage.parts = parts;
        upload.storage.session = None;
        upload.completed = true;
        self.infos.put(upload).await?;
        self.delete_tail_best_effort(old_tail).await;

        info!("Upload {} completed ({} bytes)", upload.id, upload.offset);
        Ok(())
    }

    /// Whether the assembled object exists with the expected length.
    async fn data_exists(&self, upload: &UploadInfo) -> bool {
        match self.store.list_blobs(&upload.storage.key).await {
            Ok(entries) => entries
                .iter()
                .any(|e| e.key == upload.storage.key && Some(e.size) == upload.size),
            Err(_) => false,
        }
    }

    /// Discard an upload and everything stored for it. Deleting an unknown
    /// upload succeeds.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &UploadId) -> Result<(), UploadError> {
        let _guard = self.registry.lock(id.as_str()).await;
        let upload = match self.infos.get(id).await {
            Ok(info) => info,
            Err(StorageError::NotFound(_)) => {
                debug!("Delete of unknown upload {}", id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.terminate_locked(&upload).await?;
        info!("Upload {} terminated", id);
        Ok(())
    }

    async fn terminate_locked(&self, upload: &UploadInfo) -> Result<(), UploadError> {
        if let Some(session) = &upload.storage.session {
            self.store.abort_session(session).await?;
        }
        self.store.delete_blob(&upload.storage.key).await?;
        if let Some(tail) = &upload.storage.pending {
            self.store.delete_blob(&tail.key).await?;
        }
        self.infos.delete(&upload.id).await?;
        Ok(())
    }

    /// Terminate incomplete uploads whose expiry has passed. Returns how
    /// many were removed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, UploadError> {
        let Some(expiry) = self.options.upload_expiry else {
            return Ok(0);
        };

        let mut removed = 0;
        for id in self.infos.list_ids().await? {
            let _guard = self.registry.lock(id.as_str()).await;
            let upload = match self.infos.get(&id).await {
                Ok(info) => info,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("Skipping {} during expiry sweep: {}", id, e);
                    continue;
                }
            };
            if upload.expires_at(Some(expiry)).is_some_and(|at| at <= now) {
                match self.terminate_locked(&upload).await {
                    Ok(()) => {
                        info!("Expired upload {} terminated", id);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to terminate expired upload {}: {}", id, e),
                }
            }
        }
        Ok(removed)
    }

    async fn abort_best_effort(&self, session: &SessionHandle) {
        if let Err(e) = self.store.abort_session(session).await {
            warn!("Failed to abort session {}: {}", session.token, e);
        }
    }

    async fn delete_tail_best_effort(&self, tail: Option<PendingTail>) {
        if let Some(tail) = tail {
            if let Err(e) = self.store.delete_blob(&tail.key).await {
                warn!("Failed to delete pending tail {}: {}", tail.key, e);
            }
        }
    }
}

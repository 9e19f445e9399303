//! Maps arbitrary client chunks onto backend part boundaries.
//!
//! Bytes accumulate in one buffer. Whenever the buffer holds at least
//! `min_part_size` bytes, or the upload's known size has been reached, the
//! buffer is written as the next numbered part. Parts are written strictly in
//! byte order, one at a time.

use super::error::UploadError;
use crate::storage::{ObjectStore, PartHandle, PartLimits, SessionHandle};
use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Result of feeding one request body through the assembler
#[derive(Debug)]
pub struct Assembled {
    /// Parts written by this assembler, in order
    pub parts: Vec<PartHandle>,
    /// Buffered bytes that did not make a full part
    pub remainder: Bytes,
}

pub struct PartAssembler<'a> {
    store: &'a dyn ObjectStore,
    session: &'a SessionHandle,
    limits: PartLimits,
    buffer: BytesMut,
    /// Bytes covered by parts, existing and new
    flushed: u64,
    next_number: u32,
    /// Known total size; reaching it flushes the tail as the last part
    size: Option<u64>,
    /// Hard upper bound on the total (known size or server maximum)
    ceiling: Option<u64>,
    written: Vec<PartHandle>,
}

impl<'a> PartAssembler<'a> {
    /// Resume after `existing` parts, with the pending tail bytes preloaded.
    pub fn new(
        store: &'a dyn ObjectStore,
        session: &'a SessionHandle,
        existing: &[PartHandle],
        pending: Bytes,
    ) -> Self {
        let limits = store.limits();
        let mut buffer = BytesMut::with_capacity(limits.min_part_size.min(1 << 24) as usize);
        buffer.extend_from_slice(&pending);
        Self {
            store,
            session,
            limits,
            buffer,
            flushed: existing.iter().map(|p| p.size).sum(),
            next_number: existing.len() as u32 + 1,
            size: None,
            ceiling: None,
            written: Vec::new(),
        }
    }

    /// Bound the upload by its declared size, or by `max` while deferred.
    pub fn with_size(mut self, size: Option<u64>, max: Option<u64>) -> Self {
        self.size = size;
        self.ceiling = size.or(max);
        self
    }

    /// Bytes accepted so far: flushed parts plus the buffer.
    pub fn offset(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    /// Offset covered by durable parts only.
    pub fn flushed_offset(&self) -> u64 {
        self.flushed
    }

    pub fn is_complete(&self) -> bool {
        self.size == Some(self.offset())
    }

    /// Append one chunk, writing parts as boundaries are crossed.
    pub async fn push(&mut self, chunk: Bytes) -> Result<(), UploadError> {
        let attempted = self.offset() + chunk.len() as u64;
        if let Some(limit) = self.ceiling {
            if attempted > limit {
                return Err(UploadError::SizeExceeded { attempted, limit });
            }
        }
        self.buffer.extend_from_slice(&chunk);

        while self.buffer.len() as u64 >= self.limits.min_part_size {
            let n = self.buffer.len().min(self.limits.max_part_size as usize);
            self.flush(n).await?;
        }
        if self.is_complete() && !self.buffer.is_empty() {
            self.flush(self.buffer.len()).await?;
        }
        Ok(())
    }

    /// Write whatever is buffered as the final part.
    pub async fn flush_tail(&mut self) -> Result<(), UploadError> {
        if !self.buffer.is_empty() {
            self.flush(self.buffer.len()).await?;
        }
        Ok(())
    }

    /// Write the first `n` buffered bytes as the next part. On failure the
    /// buffer is left as it was.
    async fn flush(&mut self, n: usize) -> Result<(), UploadError> {
        let number = self.next_number;
        if number > self.limits.max_part_count {
            return Err(UploadError::InvalidRequest(format!(
                "upload needs more than {} parts",
                self.limits.max_part_count
            )));
        }

        let data = self.buffer.split_to(n).freeze();
        match self.store.write_part(self.session, number, data.clone()).await {
            Ok(part) => {
                debug!(
                    "Flushed part {} of {} ({} bytes)",
                    number, self.session.key, part.size
                );
                self.flushed += part.size;
                self.next_number += 1;
                self.written.push(part);
                Ok(())
            }
            Err(e) => {
                let mut restored = BytesMut::from(&data[..]);
                restored.unsplit(std::mem::take(&mut self.buffer));
                self.buffer = restored;
                Err(e.into())
            }
        }
    }

    pub fn finish(self) -> Assembled {
        Assembled {
            parts: self.written,
            remainder: self.buffer.freeze(),
        }
    }
}

//! S3 object store implementation using AWS SDK
//!
//! Upload data maps onto native S3 multipart uploads: an upload session is an
//! S3 `UploadId`, a part is an `UploadPart` (or `UploadPartCopy` for
//! concatenation), and committing is `CompleteMultipartUpload`. Small blobs
//! (upload info, pending tails) are plain objects next to the data.

use super::retry::RetryPolicy;
use super::traits::{
    check_part_sizes, BlobEntry, ObjectStore, PartHandle, PartLimits, SessionHandle, StorageError,
};
use crate::config::BackendConfig;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, instrument, warn};

/// S3 object store bound to one bucket and an optional key prefix
pub struct S3Store {
    client: Client,
    bucket: String,
    key_prefix: String,
    limits: PartLimits,
    retry: RetryPolicy,
}

impl S3Store {
    /// Build an S3 client from a BackendConfig without creating an S3Store.
    /// Useful for one-off operations like testing connectivity.
    pub fn build_client(config: &BackendConfig) -> Result<Client, StorageError> {
        let BackendConfig::S3 {
            endpoint,
            region,
            force_path_style,
            access_key_id,
            secret_access_key,
            ..
        } = config
        else {
            return Err(StorageError::Other(
                "S3Store requires S3 configuration".to_string(),
            ));
        };

        // Explicit credentials only; the default AWS credential chain is never consulted
        let credentials = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                Credentials::new(key_id, secret, None, None, "tusgate-config")
            }
            _ => {
                return Err(StorageError::Other(
                    "S3 backend requires explicit credentials: set TUSGATE_S3_ACCESS_KEY_ID and TUSGATE_S3_SECRET_ACCESS_KEY".to_string(),
                ));
            }
        };

        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()))
            .credentials_provider(credentials)
            .force_path_style(*force_path_style);

        if let Some(ep) = endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(ep);
        }

        Ok(Client::from_conf(s3_config_builder.build()))
    }

    /// Create a new S3 store from configuration
    pub fn new(
        config: &BackendConfig,
        limits: PartLimits,
        retry: RetryPolicy,
    ) -> Result<Self, StorageError> {
        let client = Self::build_client(config)?;
        let BackendConfig::S3 {
            bucket, key_prefix, ..
        } = config
        else {
            return Err(StorageError::Other(
                "S3Store requires S3 configuration".to_string(),
            ));
        };
        debug!("S3Store initialized for bucket {}", bucket);
        Ok(Self {
            client,
            bucket: bucket.clone(),
            key_prefix: key_prefix.clone().unwrap_or_default(),
            limits,
            retry,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn strip_prefix<'a>(&self, full_key: &'a str) -> &'a str {
        full_key
            .strip_prefix(self.key_prefix.as_str())
            .unwrap_or(full_key)
    }

    /// Classify an S3 SDK error into the adapter taxonomy.
    fn classify_s3_error<E>(key: &str, e: &SdkError<E>, context: &str) -> StorageError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match e {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                StorageError::Transient(format!("{} {} failed: {}", context, key, e))
            }
            SdkError::ServiceError(svc) => classify_service_error(
                key,
                svc.raw().status().as_u16(),
                e.code(),
                &format!("{} failed: {}", context, e),
            ),
            _ => StorageError::S3(format!("{} failed: {}", context, e)),
        }
    }
}

/// Map an S3 service error (status + error code) to a `StorageError`.
fn classify_service_error(key: &str, status: u16, code: Option<&str>, message: &str) -> StorageError {
    match code {
        Some("NoSuchBucket") => return StorageError::S3(message.to_string()),
        Some("NoSuchKey") | Some("NoSuchUpload") | Some("NotFound") => {
            return StorageError::NotFound(key.to_string())
        }
        Some("EntityTooSmall") | Some("InvalidPart") | Some("InvalidPartOrder") => {
            return StorageError::CommitFailed(message.to_string())
        }
        Some("SlowDown") | Some("RequestTimeout") | Some("InternalError") => {
            return StorageError::Transient(message.to_string())
        }
        _ => {}
    }
    match status {
        404 => StorageError::NotFound(key.to_string()),
        429 | 500..=599 => StorageError::Transient(message.to_string()),
        _ => StorageError::S3(message.to_string()),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn limits(&self) -> PartLimits {
        self.limits
    }

    #[instrument(skip(self))]
    async fn open_session(&self, key: &str) -> Result<SessionHandle, StorageError> {
        let full_key = self.full_key(key);
        let response = self
            .retry
            .once("create_multipart_upload", async {
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .send()
                    .await
                    .map_err(|e| Self::classify_s3_error(key, &e, "create_multipart_upload"))
            })
            .await?;

        let token = response
            .upload_id()
            .ok_or_else(|| StorageError::S3("CreateMultipartUpload returned no UploadId".into()))?
            .to_string();
        debug!("S3 multipart session {} opened for {}", token, key);
        Ok(SessionHandle {
            key: key.to_string(),
            token,
        })
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn write_part(
        &self,
        session: &SessionHandle,
        number: u32,
        data: Bytes,
    ) -> Result<PartHandle, StorageError> {
        let full_key = self.full_key(&session.key);
        let size = data.len() as u64;
        // UploadPart with the same number overwrites, so it is safe to repeat.
        let response = self
            .retry
            .idempotent("upload_part", || {
                let body = ByteStream::from(data.clone());
                let full_key = &full_key;
                async move {
                    self.client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(full_key)
                        .upload_id(&session.token)
                        .part_number(number as i32)
                        .body(body)
                        .send()
                        .await
                        .map_err(|e| Self::classify_s3_error(&session.key, &e, "upload_part"))
                }
            })
            .await?;

        let etag = response.e_tag().unwrap_or_default().to_string();
        debug!("S3 part {} of {} written ({} bytes)", number, session.key, size);
        Ok(PartHandle { number, etag, size })
    }

    #[instrument(skip(self))]
    async fn copy_part(
        &self,
        session: &SessionHandle,
        number: u32,
        source_key: &str,
    ) -> Result<PartHandle, StorageError> {
        let source_full = self.full_key(source_key);
        let head = self
            .retry
            .idempotent("head_object", || async {
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(&source_full)
                    .send()
                    .await
                    .map_err(|e| Self::classify_s3_error(source_key, &e, "head_object"))
            })
            .await?;
        let size = head.content_length().unwrap_or(0).max(0) as u64;

        let full_key = self.full_key(&session.key);
        let copy_source = format!("{}/{}", self.bucket, source_full);
        let response = self
            .retry
            .idempotent("upload_part_copy", || async {
                self.client
                    .upload_part_copy()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .upload_id(&session.token)
                    .part_number(number as i32)
                    .copy_source(&copy_source)
                    .send()
                    .await
                    .map_err(|e| Self::classify_s3_error(source_key, &e, "upload_part_copy"))
            })
            .await?;

        let etag = response
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .to_string();
        Ok(PartHandle { number, etag, size })
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn commit_session(
        &self,
        session: &SessionHandle,
        parts: &[PartHandle],
    ) -> Result<(), StorageError> {
        // S3 rejects a multipart upload with zero parts; an empty object is
        // written directly instead.
        if parts.is_empty() {
            if let Err(e) = self.abort_session(session).await {
                warn!(
                    "Failed to abort empty multipart upload {} for {}: {}",
                    session.token, session.key, e
                );
            }
            return self.put_blob(&session.key, Bytes::new()).await;
        }
        check_part_sizes(parts, &self.limits)?;

        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .e_tag(&p.etag)
                    .part_number(p.number as i32)
                    .build()
            })
            .collect();
        let full_key = self.full_key(&session.key);

        self.retry
            .once("complete_multipart_upload", async {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .upload_id(&session.token)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        Self::classify_s3_error(&session.key, &e, "complete_multipart_upload")
                    })
            })
            .await?;

        debug!("S3 multipart session {} committed", session.token);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_session(&self, session: &SessionHandle) -> Result<(), StorageError> {
        let full_key = self.full_key(&session.key);
        let result = self
            .retry
            .idempotent("abort_multipart_upload", || async {
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .upload_id(&session.token)
                    .send()
                    .await
                    .map_err(|e| Self::classify_s3_error(&session.key, &e, "abort_multipart_upload"))
            })
            .await;
        match result {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put_blob(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        self.retry
            .idempotent("put_object", || {
                let body = ByteStream::from(data.clone());
                let full_key = &full_key;
                async move {
                    self.client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(full_key)
                        .body(body)
                        .send()
                        .await
                        .map_err(|e| Self::classify_s3_error(key, &e, "put_object"))
                }
            })
            .await?;
        debug!("S3 PUT {}/{} ({} bytes)", self.bucket, key, data.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_blob(&self, key: &str) -> Result<Bytes, StorageError> {
        let full_key = self.full_key(key);
        self.retry
            .idempotent("get_object", || async {
                let response = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .send()
                    .await
                    .map_err(|e| Self::classify_s3_error(key, &e, "get_object"))?;
                let data = response.body.collect().await.map_err(|e| {
                    StorageError::Transient(format!("Failed to read response body: {}", e))
                })?;
                Ok(data.into_bytes())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_blob(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        self.retry
            .idempotent("delete_object", || async {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .send()
                    .await
                    .map_err(|e| Self::classify_s3_error(key, &e, "delete_object"))
            })
            .await?;
        debug!("S3 DELETE {}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let token = continuation_token.clone();
            let response = self
                .retry
                .idempotent("list_objects_v2", || {
                    let token = token.clone();
                    let full_prefix = &full_prefix;
                    async move {
                        let mut request = self
                            .client
                            .list_objects_v2()
                            .bucket(&self.bucket)
                            .prefix(full_prefix);
                        if let Some(token) = token {
                            request = request.continuation_token(token);
                        }
                        request
                            .send()
                            .await
                            .map_err(|e| Self::classify_s3_error(prefix, &e, "list_objects_v2"))
                    }
                })
                .await?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    results.push(BlobEntry {
                        key: self.strip_prefix(key).to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("Listed {} objects under {}/{}", results.len(), self.bucket, prefix);
        Ok(results)
    }
}

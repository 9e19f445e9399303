//! S3 backend tests against MinIO
//!
//! Skipped unless MinIO is reachable on localhost:9000 with the
//! `tusgate-test` bucket present.

mod common;

use bytes::Bytes;
use common::{
    create_upload, generate_binary, head_offset, minio_client, patch_chunk, upload_id,
    upload_in_chunks, TestServer, MINIO_ACCESS_KEY, MINIO_BUCKET, MINIO_ENDPOINT,
    MINIO_SECRET_KEY,
};
use tusgate::config::BackendConfig;
use tusgate::storage::{ObjectStore, PartLimits, RetryPolicy, S3Store, StorageError};

/// Unique key prefix so parallel tests never see each other's objects.
fn fresh_prefix() -> String {
    format!("tusgate-test/{}/", uuid::Uuid::new_v4().simple())
}

fn store(prefix: &str) -> S3Store {
    let config = BackendConfig::S3 {
        endpoint: Some(MINIO_ENDPOINT.to_string()),
        region: "us-east-1".to_string(),
        bucket: MINIO_BUCKET.to_string(),
        key_prefix: Some(prefix.to_string()),
        force_path_style: true,
        access_key_id: Some(MINIO_ACCESS_KEY.to_string()),
        secret_access_key: Some(MINIO_SECRET_KEY.to_string()),
    };
    S3Store::new(&config, PartLimits::default(), RetryPolicy::default()).unwrap()
}

async fn object_bytes(key: &str) -> Vec<u8> {
    minio_client()
        .await
        .get_object()
        .bucket(MINIO_BUCKET)
        .key(key)
        .send()
        .await
        .unwrap()
        .body
        .collect()
        .await
        .unwrap()
        .into_bytes()
        .to_vec()
}

#[tokio::test]
async fn test_multipart_session_commit() {
    skip_unless_minio!();
    let prefix = fresh_prefix();
    let store = store(&prefix);

    let first = generate_binary(5 * 1024 * 1024, 1);
    let last = generate_binary(1234, 2);
    let session = store.open_session("object").await.unwrap();
    let p1 = store
        .write_part(&session, 1, Bytes::from(first.clone()))
        .await
        .unwrap();
    let p2 = store
        .write_part(&session, 2, Bytes::from(last.clone()))
        .await
        .unwrap();
    store.commit_session(&session, &[p1, p2]).await.unwrap();

    let stored = object_bytes(&format!("{}object", prefix)).await;
    assert_eq!(stored.len(), first.len() + last.len());
    assert_eq!(&stored[..first.len()], &first[..]);
    assert_eq!(&stored[first.len()..], &last[..]);
}

#[tokio::test]
async fn test_undersized_part_fails_commit() {
    skip_unless_minio!();
    let store = store(&fresh_prefix());

    let session = store.open_session("small").await.unwrap();
    let p1 = store
        .write_part(&session, 1, Bytes::from_static(b"tiny"))
        .await
        .unwrap();
    let p2 = store
        .write_part(&session, 2, Bytes::from_static(b"tail"))
        .await
        .unwrap();
    let err = store.commit_session(&session, &[p1, p2]).await.unwrap_err();
    assert!(matches!(err, StorageError::CommitFailed(_)), "{err}");
    store.abort_session(&session).await.unwrap();
}

#[tokio::test]
async fn test_zero_part_commit_writes_empty_object() {
    skip_unless_minio!();
    let prefix = fresh_prefix();
    let store = store(&prefix);

    let session = store.open_session("empty").await.unwrap();
    store.commit_session(&session, &[]).await.unwrap();
    assert!(store.get_blob("empty").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_blobs_and_listing_respect_prefix() {
    skip_unless_minio!();
    let store = store(&fresh_prefix());

    store
        .put_blob("b.info", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    store.put_blob("a", Bytes::from_static(b"abc")).await.unwrap();

    let listed = store.list_blobs("").await.unwrap();
    let keys: Vec<&str> = listed.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b.info"]);
    assert_eq!(listed[0].size, 3);

    store.delete_blob("a").await.unwrap();
    store.delete_blob("a").await.unwrap();
    assert!(matches!(
        store.get_blob("a").await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_copy_part_from_existing_object() {
    skip_unless_minio!();
    let store = store(&fresh_prefix());

    let source = generate_binary(5 * 1024 * 1024, 3);
    store
        .put_blob("source", Bytes::from(source.clone()))
        .await
        .unwrap();
    let session = store.open_session("copy").await.unwrap();
    let p1 = store.copy_part(&session, 1, "source").await.unwrap();
    assert_eq!(p1.size, source.len() as u64);
    let p2 = store
        .write_part(&session, 2, Bytes::from_static(b"!"))
        .await
        .unwrap();
    store.commit_session(&session, &[p1, p2]).await.unwrap();

    let copied = store.get_blob("copy").await.unwrap();
    assert_eq!(copied.len(), source.len() + 1);
}

#[tokio::test]
async fn test_tus_upload_through_server() {
    skip_unless_minio!();
    let prefix = fresh_prefix();
    let server = TestServer::s3(&prefix).await;
    let client = reqwest::Client::new();

    let data = generate_binary(64 * 1024, 5);
    let url = upload_in_chunks(&client, &server, &data, 10_000, None).await;
    assert_eq!(
        object_bytes(&format!("{}{}", prefix, upload_id(&url))).await,
        data
    );

    // An incomplete upload keeps its pending tail across requests
    let open = create_upload(&client, &server, 20, None).await;
    let resp = patch_chunk(&client, &open, 0, vec![9u8; 7]).await;
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(head_offset(&client, &open).await, 7);
}

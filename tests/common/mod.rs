//! Shared test infrastructure for integration tests
//!
//! Provides an in-process router over the memory backend, a TestServer that
//! spawns the real binary (filesystem and S3 backends), tus request helpers,
//! and MinIO availability gating.

#![allow(dead_code)]

use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use tower::ServiceExt;
use tusgate::api::build_router;
use tusgate::api::handlers::AppState;
use tusgate::config::{BackendConfig, Config};
use tusgate::metrics::Metrics;
use tusgate::storage::{MemoryStore, ObjectStore, PartLimits};
use tusgate::tus::{EngineOptions, UploadEngine};

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

/// MinIO configuration constants
pub const MINIO_ENDPOINT: &str = "http://localhost:9000";
pub const MINIO_BUCKET: &str = "tusgate-test";
pub const MINIO_ACCESS_KEY: &str = "minioadmin";
pub const MINIO_SECRET_KEY: &str = "minioadmin";

/// Part size used by test servers so multi-part uploads stay small.
pub const TEST_MIN_PART_SIZE: u64 = 8;

pub const TUS: &str = "1.0.0";
pub const OFFSET_STREAM: &str = "application/offset+octet-stream";

// === In-process router (memory backend) ===

/// A router wired like the binary's, backed by a memory store.
pub struct TestApp {
    pub router: Router,
    pub engine: Arc<UploadEngine>,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build with a customised config. Limits, expiry and size caps are
    /// taken from the config just like `main` does.
    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config {
            backend: BackendConfig::Memory,
            limits: PartLimits {
                min_part_size: TEST_MIN_PART_SIZE,
                ..PartLimits::default()
            },
            ..Config::default()
        };
        customize(&mut config);

        let store = Arc::new(MemoryStore::new(config.limits));
        let engine = Arc::new(UploadEngine::new(
            store.clone(),
            EngineOptions {
                max_upload_size: config.max_upload_size,
                upload_expiry: config.upload_expiry,
            },
        ));
        let state = Arc::new(AppState::new(
            engine.clone(),
            Arc::new(config),
            Some(Metrics::new()),
        ));
        Self {
            router: build_router(state),
            engine,
            store,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// POST a new upload and return its path (`/uploads/<id>`).
    pub async fn create(&self, length: u64, metadata: Option<&str>) -> String {
        let mut builder = Request::post("/uploads/")
            .header("tus-resumable", TUS)
            .header("host", "tus.test")
            .header("upload-length", length.to_string());
        if let Some(md) = metadata {
            builder = builder.header("upload-metadata", md);
        }
        let response = self.send(builder.body(Body::empty()).unwrap()).await;
        assert_eq!(response.status().as_u16(), 201, "create failed");
        location_path(&response)
    }

    pub async fn patch(&self, path: &str, offset: u64, data: &'static [u8]) -> Response<Body> {
        self.send(patch_request(path, offset, data)).await
    }

    pub async fn head(&self, path: &str) -> Response<Body> {
        self.send(
            Request::head(path)
                .header("tus-resumable", TUS)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn stored(&self, path: &str) -> Vec<u8> {
        let id = path.rsplit('/').next().unwrap();
        self.store.get_blob(id).await.unwrap().to_vec()
    }
}

pub fn patch_request(path: &str, offset: u64, data: &'static [u8]) -> Request<Body> {
    Request::patch(path)
        .header("tus-resumable", TUS)
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", offset.to_string())
        .header("content-length", data.len().to_string())
        .body(Body::from(data))
        .unwrap()
}

/// Path part of the `Location` header of a creation response.
pub fn location_path(response: &Response<Body>) -> String {
    let location = header(response, "location");
    let after_scheme = location.split_once("://").map_or(location.as_str(), |(_, r)| r);
    match after_scheme.find('/') {
        Some(i) => after_scheme[i..].to_string(),
        None => "/".to_string(),
    }
}

pub fn header(response: &Response<Body>, name: &str) -> String {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {}", name))
        .to_str()
        .unwrap()
        .to_string()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Render `Upload-Metadata` from plain pairs.
pub fn metadata_header(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{} {}", k, STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

// === Spawned binary ===

/// Test server wrapper that spawns a real tusgate binary
pub struct TestServer {
    process: Child,
    port: u16,
    config_path: std::path::PathBuf,
    _config_dir: TempDir,
    data_dir: Option<TempDir>,
}

impl TestServer {
    /// Start a test server with filesystem backend (no Docker needed)
    pub async fn filesystem() -> Self {
        Self::filesystem_with("").await
    }

    /// Filesystem backend with extra top-level config lines
    pub async fn filesystem_with(extra: &str) -> Self {
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = format!(
            "[backend]\ntype = \"filesystem\"\npath = \"{}\"\n",
            data_dir.path().display()
        );
        Self::spawn_with_config(extra, &backend, TEST_MIN_PART_SIZE, Some(data_dir)).await
    }

    /// Start a test server with S3 backend (needs MinIO running). Every
    /// server gets its own key prefix inside the shared test bucket. Parts
    /// use the real S3 minimum.
    pub async fn s3(prefix: &str) -> Self {
        let backend = format!(
            concat!(
                "[backend]\n",
                "type = \"s3\"\n",
                "endpoint = \"{}\"\n",
                "region = \"us-east-1\"\n",
                "bucket = \"{}\"\n",
                "key_prefix = \"{}\"\n",
                "force_path_style = true\n",
                "access_key_id = \"{}\"\n",
                "secret_access_key = \"{}\"\n",
            ),
            MINIO_ENDPOINT, MINIO_BUCKET, prefix, MINIO_ACCESS_KEY, MINIO_SECRET_KEY,
        );
        Self::spawn_with_config("", &backend, 5 * 1024 * 1024, None).await
    }

    /// Allocate a port, write a TOML config, spawn the server and wait for
    /// readiness. All factory methods delegate here.
    async fn spawn_with_config(
        extra: &str,
        backend: &str,
        min_part_size: u64,
        data_dir: Option<TempDir>,
    ) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let full_config = format!(
            "listen_addr = \"127.0.0.1:{}\"\n{}\n{}\n[limits]\nmin_part_size = {}\n",
            port, extra, backend, min_part_size
        );

        // Kept apart from the data directory so it never shows up in listings
        let config_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = config_dir.path().join("tusgate.toml");
        std::fs::write(&config_path, &full_config).expect("Failed to write test config");

        let mut server = Self {
            process: spawn_binary(&config_path),
            port,
            config_path,
            _config_dir: config_dir,
            data_dir,
        };
        server.wait_ready().await;
        server
    }

    /// Kill the process and start a new one on the same port and storage.
    pub async fn restart(mut self) -> Self {
        let _ = self.process.kill();
        let _ = self.process.wait();
        self.process = spawn_binary(&self.config_path);
        self.wait_ready().await;
        self
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(100)).await;
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    /// Get the HTTP endpoint URL
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Collection URL of the tus endpoint
    pub fn uploads_url(&self) -> String {
        format!("{}/uploads/", self.endpoint())
    }

    /// Filesystem backend root
    pub fn data_dir(&self) -> &Path {
        self.data_dir
            .as_ref()
            .expect("server has no local data directory")
            .path()
    }
}

fn spawn_binary(config_path: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_tusgate"))
        .env("TUSGATE_CONFIG", config_path)
        .env("RUST_LOG", "tusgate=warn")
        .spawn()
        .expect("Failed to start server")
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

// === tus client helpers (reqwest) ===

/// POST a new upload and return its absolute URL.
pub async fn create_upload(
    client: &reqwest::Client,
    server: &TestServer,
    length: u64,
    metadata: Option<&str>,
) -> String {
    let mut request = client
        .post(server.uploads_url())
        .header("tus-resumable", TUS)
        .header("upload-length", length.to_string());
    if let Some(md) = metadata {
        request = request.header("upload-metadata", md);
    }
    let resp = request.send().await.expect("POST failed");
    assert_eq!(resp.status().as_u16(), 201, "create failed");
    resp.headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("Location header")
        .to_string()
}

/// PATCH a chunk at the given offset and return the response.
pub async fn patch_chunk(
    client: &reqwest::Client,
    url: &str,
    offset: u64,
    data: Vec<u8>,
) -> reqwest::Response {
    client
        .patch(url)
        .header("tus-resumable", TUS)
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", offset.to_string())
        .body(data)
        .send()
        .await
        .expect("PATCH failed")
}

/// HEAD an upload and return the reported offset.
pub async fn head_offset(client: &reqwest::Client, url: &str) -> u64 {
    let resp = client
        .head(url)
        .header("tus-resumable", TUS)
        .send()
        .await
        .expect("HEAD failed");
    assert_eq!(resp.status().as_u16(), 200, "HEAD {} failed", url);
    resp.headers()
        .get("upload-offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("Upload-Offset header")
}

/// Upload `data` in `chunk`-sized PATCH requests. Returns the upload URL.
pub async fn upload_in_chunks(
    client: &reqwest::Client,
    server: &TestServer,
    data: &[u8],
    chunk: usize,
    metadata: Option<&str>,
) -> String {
    let url = create_upload(client, server, data.len() as u64, metadata).await;
    let mut offset = 0usize;
    for piece in data.chunks(chunk) {
        let resp = patch_chunk(client, &url, offset as u64, piece.to_vec()).await;
        assert_eq!(resp.status().as_u16(), 204, "PATCH at {} failed", offset);
        offset += piece.len();
    }
    url
}

/// Upload ID is the last path segment of its URL.
pub fn upload_id(url: &str) -> &str {
    url.rsplit('/').next().unwrap()
}

// === Data generators ===

/// Generate deterministic binary data
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}

// === MinIO gating ===

/// Create an S3 client pointing directly at MinIO
pub async fn minio_client() -> Client {
    let credentials = Credentials::new(MINIO_ACCESS_KEY, MINIO_SECRET_KEY, None, None, "test");
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(MINIO_ENDPOINT)
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    Client::from_conf(config)
}

/// Check if MinIO is available (TCP connect + HeadBucket with 2s timeout)
pub async fn minio_available() -> bool {
    if std::net::TcpStream::connect("localhost:9000").is_err() {
        return false;
    }

    let client = minio_client().await;
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.head_bucket().bucket(MINIO_BUCKET).send(),
    )
    .await;
    matches!(result, Ok(Ok(_)))
}

/// Skip a test if MinIO is not available.
#[macro_export]
macro_rules! skip_unless_minio {
    () => {
        if !common::minio_available().await {
            eprintln!("MinIO not available, skipping test");
            return;
        }
    };
}

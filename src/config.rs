//! Configuration for the tusgate upload server

use crate::storage::{PartLimits, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Path the upload endpoints are mounted under. Always starts and ends with '/'.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Base address for the `url` field of listing entries.
    /// Unset: S3 `endpoint/bucket`, or bare keys for local backends.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Scheme and authority used in `Location` headers (e.g. "https://uploads.example.com").
    /// Unset: derived from the request's `Host` header.
    #[serde(default)]
    pub location_base_url: Option<String>,

    /// Largest declared upload size accepted at creation
    #[serde(default)]
    pub max_upload_size: Option<u64>,

    /// Incomplete uploads older than this are terminated by the expiry sweep
    #[serde(default, with = "opt_duration_str")]
    pub upload_expiry: Option<Duration>,

    /// How often the expiry sweep runs
    #[serde(
        default = "default_expiry_sweep_interval",
        with = "crate::storage::duration_str"
    )]
    pub expiry_sweep_interval: Duration,

    /// Log level filter string.
    /// Set via config file or TUSGATE_LOG_LEVEL env var. Overridden by RUST_LOG.
    /// Default: "tusgate=debug,tower_http=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Storage backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Backend part constraints
    #[serde(default)]
    pub limits: PartLimits,

    /// Retry policy for backend calls
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Filesystem backend for local storage/development
    Filesystem {
        /// Directory for data storage
        path: PathBuf,
    },

    /// S3 backend for production use
    S3 {
        /// S3 endpoint URL (for MinIO, LocalStack, or custom S3-compatible services)
        /// If not specified, uses AWS default endpoint
        #[serde(default)]
        endpoint: Option<String>,

        /// AWS region
        #[serde(default = "default_region")]
        region: String,

        /// Bucket holding upload data and info objects
        bucket: String,

        /// Prepended to every object key (e.g. "tus/")
        #[serde(default)]
        key_prefix: Option<String>,

        /// Use path-style URLs (required for MinIO, LocalStack)
        #[serde(default = "default_force_path_style")]
        force_path_style: bool,

        /// Access key ID. Required together with `secret_access_key`.
        #[serde(default)]
        access_key_id: Option<String>,

        #[serde(default)]
        secret_access_key: Option<String>,
    },

    /// Process-local memory, lost on restart
    Memory,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_base_path() -> String {
    "/uploads/".to_string()
}

fn default_expiry_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_log_level() -> String {
    "tusgate=debug,tower_http=debug".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            path: PathBuf::from("./data"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            base_path: default_base_path(),
            public_base_url: None,
            location_base_url: None,
            max_upload_size: None,
            upload_expiry: None,
            expiry_sweep_interval: default_expiry_sweep_interval(),
            log_level: default_log_level(),
            backend: BackendConfig::default(),
            limits: PartLimits::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Parse an env var into `T`, ignoring unset or malformed values.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_duration(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("TUSGATE_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("TUSGATE_BASE_PATH") {
            config.base_path = normalize_base_path(&path);
        }
        config.public_base_url = std::env::var("TUSGATE_PUBLIC_BASE_URL").ok();
        config.location_base_url = std::env::var("TUSGATE_LOCATION_BASE_URL").ok();
        config.max_upload_size = env_parse("TUSGATE_MAX_UPLOAD_SIZE");
        config.upload_expiry = env_duration("TUSGATE_UPLOAD_EXPIRY");
        if let Some(interval) = env_duration("TUSGATE_EXPIRY_SWEEP_INTERVAL") {
            config.expiry_sweep_interval = interval;
        }

        // S3 backend when a bucket is named, else filesystem/memory
        if let Ok(bucket) = std::env::var("TUSGATE_S3_BUCKET") {
            config.backend = BackendConfig::S3 {
                endpoint: std::env::var("TUSGATE_S3_ENDPOINT").ok(),
                region: std::env::var("TUSGATE_S3_REGION").unwrap_or_else(|_| default_region()),
                bucket,
                key_prefix: std::env::var("TUSGATE_S3_KEY_PREFIX").ok(),
                force_path_style: std::env::var("TUSGATE_S3_PATH_STYLE")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                access_key_id: std::env::var("TUSGATE_S3_ACCESS_KEY_ID").ok(),
                secret_access_key: std::env::var("TUSGATE_S3_SECRET_ACCESS_KEY").ok(),
            };
        } else if std::env::var("TUSGATE_BACKEND").as_deref() == Ok("memory") {
            config.backend = BackendConfig::Memory;
        } else if let Ok(dir) = std::env::var("TUSGATE_DATA_DIR") {
            config.backend = BackendConfig::Filesystem {
                path: PathBuf::from(dir),
            };
        }

        if let Some(size) = env_parse("TUSGATE_MIN_PART_SIZE") {
            config.limits.min_part_size = size;
        }
        if let Some(size) = env_parse("TUSGATE_MAX_PART_SIZE") {
            config.limits.max_part_size = size;
        }
        if let Some(count) = env_parse("TUSGATE_MAX_PART_COUNT") {
            config.limits.max_part_count = count;
        }

        if let Some(attempts) = env_parse("TUSGATE_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }
        if let Some(delay) = env_duration("TUSGATE_RETRY_BASE_DELAY") {
            config.retry.base_delay = delay;
        }
        if let Some(timeout) = env_duration("TUSGATE_RETRY_CALL_TIMEOUT") {
            config.retry.call_timeout = timeout;
        }

        if let Ok(level) = std::env::var("TUSGATE_LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Load configuration from an explicit path, TUSGATE_CONFIG, a default
    /// file location, or finally the environment.
    pub fn load(explicit: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("TUSGATE_CONFIG") {
            return Self::from_file(&path);
        }

        for path in &["tusgate.toml", "/etc/tusgate/config.toml"] {
            if std::path::Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_path.starts_with('/') || !self.base_path.ends_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_path must start and end with '/': {:?}",
                self.base_path
            )));
        }
        if self.limits.min_part_size == 0 || self.limits.min_part_size > self.limits.max_part_size
        {
            return Err(ConfigError::Invalid(format!(
                "min_part_size ({}) must be between 1 and max_part_size ({})",
                self.limits.min_part_size, self.limits.max_part_size
            )));
        }
        if self.limits.max_part_count == 0 {
            return Err(ConfigError::Invalid("max_part_count must be at least 1".into()));
        }
        if self.expiry_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "expiry_sweep_interval must be non-zero".into(),
            ));
        }
        if let BackendConfig::S3 { bucket, .. } = &self.backend {
            if bucket.is_empty() {
                return Err(ConfigError::Invalid("S3 bucket must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Base address for listing URLs: the configured public base, or the
    /// S3 bucket address when the backend is S3.
    pub fn listing_base_url(&self) -> Option<String> {
        if let Some(base) = &self.public_base_url {
            return Some(base.trim_end_matches('/').to_string());
        }
        let BackendConfig::S3 {
            endpoint,
            region,
            bucket,
            key_prefix,
            ..
        } = &self.backend
        else {
            return None;
        };
        let bucket_url = match endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), bucket),
            None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
        };
        match key_prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => Some(format!("{}/{}", bucket_url, prefix)),
            _ => Some(bucket_url),
        }
    }
}

fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// `Option<Duration>` as an optional humantime string.
mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

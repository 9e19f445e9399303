//! tus request handlers
//!
//! Split into submodules by domain:
//! - `upload`: OPTIONS, POST, HEAD, PATCH, DELETE for the tus protocol
//! - `listing`: JSON listing of stored files
//! - `status`: Health check

mod listing;
mod status;
mod upload;

use super::errors::ApiError;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::tus::UploadEngine;
use axum::http::HeaderValue;
use std::sync::Arc;

pub use listing::list_uploads;
pub use status::{health_check, HealthResponse};
pub use upload::{create_upload, delete_upload, head_upload, options, patch_upload};

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<UploadEngine>,
    pub config: Arc<Config>,
    /// `None` disables the metrics middleware and the `/metrics` endpoint
    pub metrics: Option<Metrics>,
    /// Prefix for URLs in the file listing
    pub listing_base_url: Option<String>,
}

impl AppState {
    pub fn new(engine: Arc<UploadEngine>, config: Arc<Config>, metrics: Option<Metrics>) -> Self {
        let listing_base_url = config.listing_base_url();
        Self {
            engine,
            config,
            metrics,
            listing_base_url,
        }
    }

    /// Count a failed operation by its error code.
    fn record_error(&self, err: &ApiError) {
        if let Some(m) = &self.metrics {
            m.upload_errors_total.with_label_values(&[err.code()]).inc();
        }
    }
}

fn hval(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

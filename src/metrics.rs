//! Prometheus metrics for tusgate.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;

/// All Prometheus metrics for tusgate.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_request_size_bytes: HistogramVec,

    // -- Uploads --
    pub uploads_created_total: IntCounter,
    pub uploads_completed_total: IntCounter,
    pub uploads_terminated_total: IntCounter,
    pub uploads_expired_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub parts_written_total: IntCounter,
    pub upload_errors_total: IntCounterVec,
    pub locked_uploads: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("tusgate_build_info", "Build information"),
            &["version", "backend_type"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "tusgate_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tusgate_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        // [1KB, 10KB, 100KB, 1MB, 10MB, 100MB]
        let body_size_buckets = prometheus::exponential_buckets(1024.0, 10.0, 6).unwrap();
        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "tusgate_http_request_size_bytes",
                "HTTP request body size in bytes",
            )
            .buckets(body_size_buckets),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_size_bytes.clone()))
            .unwrap();

        // -- Uploads --
        let uploads_created_total =
            IntCounter::new("tusgate_uploads_created_total", "Uploads created").unwrap();
        registry
            .register(Box::new(uploads_created_total.clone()))
            .unwrap();

        let uploads_completed_total = IntCounter::new(
            "tusgate_uploads_completed_total",
            "Uploads whose backend object was committed",
        )
        .unwrap();
        registry
            .register(Box::new(uploads_completed_total.clone()))
            .unwrap();

        let uploads_terminated_total = IntCounter::new(
            "tusgate_uploads_terminated_total",
            "Uploads deleted by clients",
        )
        .unwrap();
        registry
            .register(Box::new(uploads_terminated_total.clone()))
            .unwrap();

        let uploads_expired_total = IntCounter::new(
            "tusgate_uploads_expired_total",
            "Incomplete uploads removed by the expiry sweep",
        )
        .unwrap();
        registry
            .register(Box::new(uploads_expired_total.clone()))
            .unwrap();

        let bytes_received_total = IntCounter::new(
            "tusgate_bytes_received_total",
            "Upload bytes accepted from clients",
        )
        .unwrap();
        registry
            .register(Box::new(bytes_received_total.clone()))
            .unwrap();

        let parts_written_total = IntCounter::new(
            "tusgate_parts_written_total",
            "Parts written to the object store",
        )
        .unwrap();
        registry
            .register(Box::new(parts_written_total.clone()))
            .unwrap();

        let upload_errors_total = IntCounterVec::new(
            Opts::new("tusgate_upload_errors_total", "Failed upload operations by code"),
            &["code"],
        )
        .unwrap();
        registry
            .register(Box::new(upload_errors_total.clone()))
            .unwrap();

        let locked_uploads = IntGauge::new(
            "tusgate_locked_uploads",
            "Uploads currently locked or awaited (updated on scrape)",
        )
        .unwrap();
        registry.register(Box::new(locked_uploads.clone())).unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            http_requests_total,
            http_request_duration_seconds,
            http_request_size_bytes,
            uploads_created_total,
            uploads_completed_total,
            uploads_terminated_total,
            uploads_expired_total,
            bytes_received_total,
            parts_written_total,
            upload_errors_total,
            locked_uploads,
        }
    }
}

/// Classify a request into a bounded operation label.
pub fn classify_tus_operation(method: &str, path: &str, base_path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/metrics" => return "metrics",
        _ => {}
    }

    let base = base_path.trim_end_matches('/');
    let Some(rest) = path.strip_prefix(base) else {
        return "unknown";
    };
    let on_collection = rest.is_empty() || rest == "/";

    match (method, on_collection) {
        ("OPTIONS", _) => "options",
        ("POST", true) => "create",
        ("GET", true) => "list",
        ("HEAD", false) => "query",
        ("PATCH", false) => "append",
        ("DELETE", false) => "terminate",
        _ => "unknown",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let operation = classify_tus_operation(&method, &path, &state.config.base_path);

    // Record request size from Content-Length if available
    if let Some(cl) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_request_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    response
}

/// Handler for GET /metrics, in Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    metrics
        .locked_uploads
        .set(state.engine.registry().active() as i64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}

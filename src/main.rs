//! tusgate - resumable tus uploads onto multipart object storage

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tusgate::api::build_router;
use tusgate::api::handlers::AppState;
use tusgate::config::{BackendConfig, Config};
use tusgate::metrics::Metrics;
use tusgate::storage::build_store;
use tusgate::tus::{EngineOptions, UploadEngine};

/// tusgate - resumable uploads onto multipart object storage
#[derive(Parser, Debug)]
#[command(name = "tusgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    let log_level = if cli.verbose {
        "tusgate=trace,tower_http=trace".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tusgate");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Base path: {}", config.base_path);

    match &config.backend {
        BackendConfig::Filesystem { path } => {
            info!("  Backend: Filesystem");
            info!("  Data directory: {:?}", path);
        }
        BackendConfig::S3 {
            endpoint,
            bucket,
            region,
            key_prefix,
            ..
        } => {
            info!("  Backend: S3");
            info!("  Bucket: {}", bucket);
            info!("  Region: {}", region);
            if let Some(ep) = endpoint {
                info!("  Endpoint: {}", ep);
            }
            if let Some(prefix) = key_prefix {
                info!("  Key prefix: {}", prefix);
            }
        }
        BackendConfig::Memory => {
            warn!("  Backend: Memory (uploads are lost on restart)");
        }
    }
    info!(
        "  Part limits: min {} bytes, max {} bytes, {} parts",
        config.limits.min_part_size, config.limits.max_part_size, config.limits.max_part_count
    );
    match config.max_upload_size {
        Some(max) => info!("  Max upload size: {} bytes", max),
        None => info!("  Max upload size: unlimited"),
    }

    let store = build_store(&config.backend, config.limits, config.retry.clone()).await?;

    let metrics = Metrics::new();
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0),
    );
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION"), store.backend_name()])
        .set(1.0);

    let engine = Arc::new(UploadEngine::new(
        store,
        EngineOptions {
            max_upload_size: config.max_upload_size,
            upload_expiry: config.upload_expiry,
        },
    ));

    if let Some(expiry) = config.upload_expiry {
        info!(
            "  Upload expiry: {} (sweep every {})",
            humantime::format_duration(expiry),
            humantime::format_duration(config.expiry_sweep_interval)
        );
        tokio::spawn(expiry_sweep(
            engine.clone(),
            metrics.clone(),
            config.expiry_sweep_interval,
        ));
    }

    let listen_addr = config.listen_addr;
    let state = Arc::new(AppState::new(engine, Arc::new(config), Some(metrics)));
    let app = build_router(state);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("tusgate listening on http://{}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Periodically terminate incomplete uploads past their expiry.
async fn expiry_sweep(engine: Arc<UploadEngine>, metrics: Metrics, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.cleanup_expired(chrono::Utc::now()).await {
            Ok(0) => {}
            Ok(removed) => {
                info!("Expiry sweep removed {} uploads", removed);
                metrics.uploads_expired_total.inc_by(removed as u64);
            }
            Err(e) => warn!("Expiry sweep failed: {}", e),
        }
    }
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

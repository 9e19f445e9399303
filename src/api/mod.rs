//! tus HTTP surface

mod errors;
pub mod handlers;
pub mod headers;

pub use errors::ApiError;

use crate::metrics::{http_metrics_middleware, metrics_handler};
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, head};
use axum::Router;
use handlers::{
    create_upload, delete_upload, head_upload, health_check, list_uploads, options, patch_upload,
    AppState,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
///
/// Routes, relative to the configured base path (default `/uploads/`):
///   OPTIONS {base}       - capability discovery
///   POST    {base}       - create an upload
///   GET     {base}       - list stored files
///   HEAD    {base}{id}   - current offset
///   PATCH   {base}{id}   - append bytes
///   DELETE  {base}{id}   - terminate
///   GET /health, GET /metrics
pub fn build_router(state: Arc<AppState>) -> Router {
    let base = state.config.base_path.clone();

    let collection = get(list_uploads).post(create_upload).options(options);
    let mut tus = Router::new()
        .route(&base, collection.clone())
        .route(
            &format!("{}:id", base),
            head(head_upload)
                .patch(patch_upload)
                .delete(delete_upload)
                .options(options),
        );
    let bare = base.trim_end_matches('/');
    if !bare.is_empty() {
        tus = tus.route(bare, collection);
    }
    let tus = tus.layer(middleware::from_fn(headers::tus_protocol_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .merge(tus)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        // Upload bodies are streamed; size limits are enforced per upload
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

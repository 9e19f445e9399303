//! JSON listing of stored files.

use super::AppState;
use crate::api::errors::ApiError;
use crate::tus::{list_files, FileEntry};
use axum::extract::State;
use axum::Json;
use std::sync::Arc;

/// GET {base}
pub async fn list_uploads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FileEntry>>, ApiError> {
    list_files(
        state.engine.store().as_ref(),
        state.listing_base_url.as_deref(),
    )
    .await
    .map(Json)
    .map_err(ApiError::Listing)
    .inspect_err(|e| state.record_error(e))
}

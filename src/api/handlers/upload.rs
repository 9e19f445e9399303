//! tus protocol handlers: discovery, creation, offset query, append and
//! termination.

use super::{hval, AppState};
use crate::api::errors::ApiError;
use crate::api::headers as h;
use crate::tus::{AppendOutcome, AppendRequest, BodyStream, Concat, CreateRequest};
use crate::types::{UploadId, UploadInfo, TUS_VERSION};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// OPTIONS {base} and {base}{id}
pub async fn options(State(state): State<Arc<AppState>>) -> Response {
    let mut extensions = vec![
        "creation",
        "creation-defer-length",
        "creation-with-upload",
        "termination",
        "concatenation",
    ];
    if state.engine.options().upload_expiry.is_some() {
        extensions.push("expiration");
    }

    let mut headers = HeaderMap::new();
    headers.insert(h::TUS_VERSION_HEADER, hval(TUS_VERSION));
    headers.insert(h::TUS_EXTENSION, hval(&extensions.join(",")));
    if let Some(max) = state.engine.options().max_upload_size {
        headers.insert(h::TUS_MAX_SIZE, hval(&max.to_string()));
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// POST {base}
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    create_inner(&state, &headers, body)
        .await
        .inspect_err(|e| state.record_error(e))
}

async fn create_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let length = h::upload_length(headers)?;
    let deferred = h::defer_length(headers)?;
    let concat = h::parse_concat(h::header_str(headers, h::UPLOAD_CONCAT)?)?;
    let metadata = match h::header_str(headers, h::UPLOAD_METADATA)? {
        Some(raw) => h::parse_metadata(raw)?,
        None => Default::default(),
    };

    if !matches!(concat, Concat::Final(_)) {
        match (length, deferred) {
            (Some(_), true) => {
                return Err(ApiError::InvalidHeader {
                    name: h::UPLOAD_DEFER_LENGTH,
                    reason: "cannot be combined with Upload-Length".to_string(),
                })
            }
            (None, false) => return Err(ApiError::MissingHeader(h::UPLOAD_LENGTH)),
            _ => {}
        }
    }

    let mut upload = state
        .engine
        .create(CreateRequest {
            size: length,
            metadata,
            concat,
        })
        .await?;
    if let Some(m) = &state.metrics {
        m.uploads_created_total.inc();
        if upload.completed {
            m.uploads_completed_total.inc();
        }
    }

    let location = upload_url(state, headers, &upload.id);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::LOCATION, hval(&location));

    // creation-with-upload: the body is the first chunk
    let content_length = h::content_length(headers)?;
    let with_body =
        h::has_offset_content_type(headers) && content_length.map_or(true, |len| len > 0);
    if with_body && !upload.completed {
        let request = AppendRequest {
            offset: 0,
            declare_size: None,
            content_length,
        };
        match state
            .engine
            .append(upload.id.clone(), request, body_stream(body))
            .await
        {
            Ok(outcome) => {
                record_append(state, &outcome);
                upload.offset = outcome.offset;
                upload.completed = outcome.completed;
            }
            Err(e) => {
                // The upload exists; the client resumes from the stored offset.
                warn!("Initial chunk for {} not accepted: {}", upload.id, e);
                state.record_error(&ApiError::Upload(e));
                if let Ok(current) = state.engine.query(&upload.id).await {
                    upload = current;
                }
            }
        }
        response_headers.insert(h::UPLOAD_OFFSET, hval(&upload.offset.to_string()));
    }
    insert_expires(state, &upload, &mut response_headers);

    debug!("Upload {} available at {}", upload.id, location);
    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// HEAD {base}{id}
pub async fn head_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = UploadId::parse(&id)?;
    let upload = state.engine.query(&id).await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(h::UPLOAD_OFFSET, hval(&upload.offset.to_string()));
    match upload.size {
        Some(size) => response_headers.insert(h::UPLOAD_LENGTH, hval(&size.to_string())),
        None => response_headers.insert(h::UPLOAD_DEFER_LENGTH, hval("1")),
    };
    if !upload.metadata.is_empty() {
        response_headers.insert(h::UPLOAD_METADATA, hval(&h::encode_metadata(&upload.metadata)));
    }
    let partial_urls: Vec<String> = upload
        .partial_uploads
        .iter()
        .map(|p| upload_url(&state, &headers, p))
        .collect();
    if let Some(concat) = h::concat_header(upload.is_partial, &partial_urls) {
        response_headers.insert(h::UPLOAD_CONCAT, hval(&concat));
    }
    insert_expires(&state, &upload, &mut response_headers);
    response_headers.insert(header::CACHE_CONTROL, hval("no-store"));

    Ok((StatusCode::OK, response_headers).into_response())
}

/// PATCH {base}{id}
pub async fn patch_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    patch_inner(&state, &id, &headers, body)
        .await
        .inspect_err(|e| state.record_error(e))
}

async fn patch_inner(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let id = UploadId::parse(id)?;
    if !h::has_offset_content_type(headers) {
        return Err(ApiError::UnsupportedMediaType);
    }
    let request = AppendRequest {
        offset: h::upload_offset(headers)?,
        declare_size: h::upload_length(headers)?,
        content_length: h::content_length(headers)?,
    };

    let outcome = state
        .engine
        .append(id.clone(), request, body_stream(body))
        .await?;
    record_append(state, &outcome);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(h::UPLOAD_OFFSET, hval(&outcome.offset.to_string()));
    if !outcome.completed && state.engine.options().upload_expiry.is_some() {
        if let Ok(upload) = state.engine.query(&id).await {
            insert_expires(state, &upload, &mut response_headers);
        }
    }
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// DELETE {base}{id}
pub async fn delete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = UploadId::parse(&id).map_err(ApiError::from)?;
    state
        .engine
        .delete(&id)
        .await
        .map_err(ApiError::from)
        .inspect_err(|e| state.record_error(e))?;
    if let Some(m) = &state.metrics {
        m.uploads_terminated_total.inc();
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Request body as the engine's chunk stream. Transport errors surface as
/// I/O errors so the engine can tell a disconnect from a storage failure.
fn body_stream(body: Body) -> BodyStream {
    body.into_data_stream()
        .map_err(std::io::Error::other)
        .boxed()
}

/// Absolute resumption URL of an upload.
fn upload_url(state: &AppState, headers: &HeaderMap, id: &UploadId) -> String {
    let base = match &state.config.location_base_url {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{}", host)
        }
    };
    format!("{}{}{}", base, state.config.base_path, id)
}

fn insert_expires(state: &AppState, upload: &UploadInfo, headers: &mut HeaderMap) {
    if let Some(at) = upload.expires_at(state.engine.options().upload_expiry) {
        headers.insert(h::UPLOAD_EXPIRES, hval(&h::http_date(at)));
    }
}

fn record_append(state: &AppState, outcome: &AppendOutcome) {
    if let Some(m) = &state.metrics {
        m.bytes_received_total.inc_by(outcome.bytes_received);
        m.parts_written_total.inc_by(outcome.parts_written as u64);
        if outcome.completed {
            m.uploads_completed_total.inc();
        }
    }
}


//! Parsing and rendering of tus protocol headers

use super::errors::ApiError;
use crate::tus::{Concat, UploadError};
use crate::types::{MetaData, UploadId, TUS_VERSION};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION_HEADER: &str = "tus-version";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_CONCAT: &str = "upload-concat";
pub const UPLOAD_EXPIRES: &str = "upload-expires";

/// Media type every PATCH body must declare
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub(crate) fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|_| ApiError::InvalidHeader {
                name,
                reason: "not valid ASCII".to_string(),
            }),
    }
}

fn parse_u64_header(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>, ApiError> {
    match header_str(headers, name)? {
        None => Ok(None),
        Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| ApiError::InvalidHeader {
            name,
            reason: format!("{:?} is not a non-negative integer", raw),
        }),
    }
}

/// `Upload-Length`, when present.
pub fn upload_length(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    parse_u64_header(headers, UPLOAD_LENGTH)
}

/// `Upload-Offset`, required on PATCH.
pub fn upload_offset(headers: &HeaderMap) -> Result<u64, ApiError> {
    parse_u64_header(headers, UPLOAD_OFFSET)?.ok_or(ApiError::MissingHeader(UPLOAD_OFFSET))
}

pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    parse_u64_header(headers, "content-length")
}

/// Whether `Upload-Defer-Length: 1` is present. Any other value is invalid.
pub fn defer_length(headers: &HeaderMap) -> Result<bool, ApiError> {
    match header_str(headers, UPLOAD_DEFER_LENGTH)? {
        None => Ok(false),
        Some("1") => Ok(true),
        Some(other) => Err(ApiError::InvalidHeader {
            name: UPLOAD_DEFER_LENGTH,
            reason: format!("must be 1, got {:?}", other),
        }),
    }
}

/// Whether the request body is declared as upload data.
pub fn has_offset_content_type(headers: &HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim())
        .is_some_and(|v| v.eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

/// Parse `Upload-Metadata`: comma-separated `key base64(value)` pairs. A key
/// without a value maps to the empty string.
pub fn parse_metadata(raw: &str) -> Result<MetaData, UploadError> {
    let mut metadata = MetaData::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut fields = pair.split_whitespace();
        let key = fields.next().unwrap_or_default();
        let value = match fields.next() {
            None => String::new(),
            Some(encoded) => {
                let decoded = STANDARD.decode(encoded).map_err(|_| {
                    UploadError::InvalidMetadata(format!("value of {:?} is not base64", key))
                })?;
                String::from_utf8(decoded).map_err(|_| {
                    UploadError::InvalidMetadata(format!("value of {:?} is not UTF-8", key))
                })?
            }
        };
        if fields.next().is_some() {
            return Err(UploadError::InvalidMetadata(format!(
                "entry {:?} has more than a key and a value",
                pair
            )));
        }
        if metadata.insert(key.to_string(), value).is_some() {
            return Err(UploadError::InvalidMetadata(format!(
                "duplicate key {:?}",
                key
            )));
        }
    }
    Ok(metadata)
}

/// Render metadata in `Upload-Metadata` form.
pub fn encode_metadata(metadata: &MetaData) -> String {
    metadata
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{} {}", k, STANDARD.encode(v))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `Upload-Concat`. Partial upload references in a final declaration
/// may be full URLs or paths; the last path segment is the ID.
pub fn parse_concat(raw: Option<&str>) -> Result<Concat, UploadError> {
    let Some(raw) = raw.map(str::trim) else {
        return Ok(Concat::None);
    };
    if raw == "partial" {
        return Ok(Concat::Partial);
    }
    let Some(list) = raw.strip_prefix("final;") else {
        return Err(UploadError::InvalidRequest(format!(
            "Upload-Concat must be \"partial\" or \"final;<urls>\", got {:?}",
            raw
        )));
    };
    let ids = list
        .split_whitespace()
        .map(|url| {
            let segment = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
            UploadId::parse(segment)
                .map_err(|e| UploadError::UnknownPartialReference(format!("{}: {}", url, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Concat::Final(ids))
}

pub fn concat_header(partial: bool, final_of: &[String]) -> Option<String> {
    if partial {
        Some("partial".to_string())
    } else if !final_of.is_empty() {
        Some(format!("final;{}", final_of.join(" ")))
    } else {
        None
    }
}

/// RFC 7231 HTTP date
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Require `Tus-Resumable: 1.0.0` on protocol requests (OPTIONS and the
/// listing GET are exempt) and stamp it on every response.
pub async fn tus_protocol_middleware(request: Request<Body>, next: Next) -> Response {
    let exempt = matches!(*request.method(), Method::OPTIONS | Method::GET);
    if !exempt {
        let version = request
            .headers()
            .get(TUS_RESUMABLE)
            .and_then(|v| v.to_str().ok());
        if version != Some(TUS_VERSION) {
            let mut response =
                ApiError::UnsupportedVersion(version.unwrap_or("").to_string()).into_response();
            response
                .headers_mut()
                .insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
            return response;
        }
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

//! tus Routes
//!
//! HTTP endpoints for the tus resumable upload protocol.
//!
//! Endpoints:
//! - OPTIONS /files - Advertise version, extensions, checksum algorithms, max size
//! - POST /files - Create an upload
//! - HEAD /files/:key - Get upload offset and length
//! - PATCH /files/:key - Append a chunk at the current offset

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{
        header::{self, IntoHeaderName},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{head, post},
    Router,
};
use chrono::{DateTime, Utc};

use crate::error::{Result, TusError};
use crate::headers::{
    TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE, TUS_VERSION,
    UPLOAD_CHECKSUM, UPLOAD_EXPIRES, UPLOAD_KEY, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
};
use crate::state::AppState;
use crate::upload::{self, describe_capabilities, parse_checksum_header, parse_metadata, CreateUpload};

// ============================================================================
// Router
// ============================================================================

/// Create the tus router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_upload).options(capabilities))
        .route(
            "/:key",
            head(upload_status).patch(upload_chunk).options(capabilities),
        )
        .layer(middleware::from_fn(tus_resumable))
}

/// Reject unsupported protocol versions and stamp `Tus-Resumable` on
/// every response
async fn tus_resumable(request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS {
        if let Some(value) = request.headers().get(TUS_RESUMABLE) {
            let version = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if !version.is_empty() && version != upload::TUS_VERSION {
                tracing::debug!(version = %version, "Rejected unsupported tus version");
                return with_resumable(TusError::VersionMismatch(version).into_response());
            }
        }
    }

    with_resumable(next.run(request).await)
}

fn with_resumable(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(upload::TUS_VERSION));
    response
}

// ============================================================================
// Handlers
// ============================================================================

/// OPTIONS /files
async fn capabilities(State(state): State<AppState>) -> Response {
    let caps = describe_capabilities(state.engine().settings().max_size);

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    set_header(headers, TUS_VERSION, caps.version);
    set_header(headers, TUS_EXTENSION, &caps.extension_header());
    set_header(headers, TUS_CHECKSUM_ALGORITHM, &caps.checksum_algorithm_header());
    if let Some(max_size) = caps.max_size {
        set_header(headers, TUS_MAX_SIZE, &max_size.to_string());
    }

    response
}

/// POST /files
async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let total_size = match header_str(&headers, UPLOAD_LENGTH)? {
        Some(value) => value.trim().parse::<u64>().map_err(|_| TusError::InvalidHeader {
            name: UPLOAD_LENGTH,
            reason: format!("'{}' is not a non-negative integer", value),
        })?,
        None => {
            return Err(TusError::InvalidHeader {
                name: UPLOAD_LENGTH,
                reason: "missing".to_string(),
            })
        }
    };

    let metadata = header_str(&headers, UPLOAD_METADATA)?
        .map(parse_metadata)
        .unwrap_or_default();

    let checksum = header_str(&headers, UPLOAD_CHECKSUM)?
        .map(parse_checksum_header)
        .transpose()?;

    let key = header_str(&headers, UPLOAD_KEY)?
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    let created = state
        .engine()
        .create_session(CreateUpload {
            key,
            total_size,
            metadata,
            checksum,
        })
        .await?;

    let mut response = StatusCode::CREATED.into_response();
    let headers = response.headers_mut();
    set_header(headers, header::LOCATION, &created.location);
    set_header(headers, UPLOAD_EXPIRES, &http_date(created.expires_at));

    Ok(response)
}

/// HEAD /files/:key
async fn upload_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    let status = state.engine().get_status(&key).await?;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    set_header(headers, UPLOAD_LENGTH, &status.total_size.to_string());
    set_header(headers, UPLOAD_OFFSET, &status.offset.to_string());
    set_header(headers, UPLOAD_EXPIRES, &http_date(status.expires_at));
    set_header(headers, header::CACHE_CONTROL, "no-store");
    if !status.metadata.is_empty() {
        set_header(headers, UPLOAD_METADATA, &status.metadata.to_header());
    }

    Ok(response)
}

/// PATCH /files/:key
///
/// The chunk is the raw request body.
async fn upload_chunk(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let claimed_offset = header_str(&headers, UPLOAD_OFFSET)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let accepted = state
        .engine()
        .apply_chunk(&key, claimed_offset, content_type, &body)
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    set_header(headers, UPLOAD_OFFSET, &accepted.offset.to_string());
    set_header(headers, UPLOAD_EXPIRES, &http_date(accepted.expires_at));

    Ok(response)
}

// ============================================================================
// Helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|_| TusError::InvalidHeader {
                name,
                reason: "not visible ASCII".to_string(),
            })
        })
        .transpose()
}

fn set_header<K: IntoHeaderName>(headers: &mut HeaderMap, name: K, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(value = %value, "Dropping unencodable response header"),
    }
}

/// RFC 7231 IMF-fixdate
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ============================================================================
// Tests
// ============================================================================

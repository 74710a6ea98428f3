//! Error types for the tus server

use axum::{
    http::{header::HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::headers;
use crate::upload::TUS_VERSION;

/// Result type used throughout the upload pipeline
pub type Result<T, E = TusError> = std::result::Result<T, E>;

/// Status code for checksum mismatches (checksum extension, non-standard)
pub const CHECKSUM_MISMATCH_STATUS: u16 = 460;

/// Protocol-level error type
#[derive(Error, Debug)]
pub enum TusError {
    #[error("Upload not found: {0}")]
    SessionNotFound(String),

    #[error("Upload key already in use: {0}")]
    SessionExists(String),

    #[error("Upload length {size} exceeds maximum size {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Upload-Offset mismatch: client sent {claimed}, server is at {actual}")]
    OffsetConflict { claimed: String, actual: u64 },

    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error("Unsupported protocol version: {0}")]
    VersionMismatch(String),

    #[error("Upload offset {offset} exceeds upload length {total}")]
    RangeExceeded { offset: u64, total: u64 },

    #[error("Checksum mismatch ({algorithm}): declared {declared}, computed {computed}")]
    ChecksumMismatch {
        algorithm: &'static str,
        declared: String,
        computed: String,
    },

    #[error("Invalid Upload-Checksum header: {0}")]
    InvalidChecksumHeader(String),

    #[error("Invalid {name} header: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("Invalid upload key: {0}")]
    InvalidUploadKey(String),

    #[error("Failed to allocate upload storage: {0}")]
    StorageAllocationFailed(String),

    #[error("Failed to write chunk: {0}")]
    WriteFailed(String),

    #[error("Unprocessable chunk: {0}")]
    UnprocessableChunk(String),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

/// Key-value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Byte sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Storage object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a client is expected to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Version, content-type or offset mismatch; correct and retry
    ProtocolPrecondition,
    /// Size ceiling or range exceeded; not retryable with the same parameters
    ResourceBoundary,
    /// Unknown or expired upload; restart the upload
    NotFound,
    /// Checksum mismatch; discard and restart the upload
    IntegrityFailure,
    /// Store or sink failure; the same chunk may be retried
    TransientIo,
    /// Malformed request headers
    BadRequest,
}

impl ErrorClass {
    /// Whether resending the same request can succeed
    pub fn retryable(&self) -> bool {
        matches!(self, Self::ProtocolPrecondition | Self::TransientIo)
    }
}

impl TusError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionExists(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::OffsetConflict { .. } => StatusCode::CONFLICT,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::VersionMismatch(_) => StatusCode::PRECONDITION_FAILED,
            Self::RangeExceeded { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::ChecksumMismatch { .. } => StatusCode::from_u16(CHECKSUM_MISMATCH_STATUS)
                .unwrap_or(StatusCode::UNPROCESSABLE_ENTITY),
            Self::InvalidChecksumHeader(_) => StatusCode::BAD_REQUEST,
            Self::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidUploadKey(_) => StatusCode::BAD_REQUEST,
            Self::StorageAllocationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::WriteFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UnprocessableChunk(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionExists(_) => "SESSION_EXISTS",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::OffsetConflict { .. } => "OFFSET_CONFLICT",
            Self::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            Self::VersionMismatch(_) => "VERSION_MISMATCH",
            Self::RangeExceeded { .. } => "RANGE_EXCEEDED",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::InvalidChecksumHeader(_) => "INVALID_CHECKSUM_HEADER",
            Self::InvalidHeader { .. } => "INVALID_HEADER",
            Self::InvalidUploadKey(_) => "INVALID_UPLOAD_KEY",
            Self::StorageAllocationFailed(_) => "STORAGE_ALLOCATION_FAILED",
            Self::WriteFailed(_) => "WRITE_FAILED",
            Self::UnprocessableChunk(_) => "UNPROCESSABLE_CHUNK",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Classify the error for client retry semantics
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SessionNotFound(_) => ErrorClass::NotFound,
            Self::SessionExists(_)
            | Self::OffsetConflict { .. }
            | Self::UnsupportedMediaType(_)
            | Self::VersionMismatch(_) => ErrorClass::ProtocolPrecondition,
            Self::PayloadTooLarge { .. } | Self::RangeExceeded { .. } => {
                ErrorClass::ResourceBoundary
            }
            Self::ChecksumMismatch { .. } => ErrorClass::IntegrityFailure,
            Self::InvalidChecksumHeader(_)
            | Self::InvalidHeader { .. }
            | Self::InvalidUploadKey(_) => ErrorClass::BadRequest,
            Self::StorageAllocationFailed(_)
            | Self::WriteFailed(_)
            | Self::UnprocessableChunk(_)
            | Self::Store(_) => ErrorClass::TransientIo,
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    class: ErrorClass,
}

impl IntoResponse for TusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let class = self.class();

        if class == ErrorClass::TransientIo {
            tracing::error!(code = self.code(), "Upload failure: {}", self);
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            class,
        });

        let mut response = (status, body).into_response();
        if matches!(self, Self::VersionMismatch(_)) {
            response
                .headers_mut()
                .insert(headers::TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            TusError::SessionNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TusError::OffsetConflict { claimed: "3".into(), actual: 5 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TusError::RangeExceeded { offset: 11, total: 10 }.status_code().as_u16(),
            416
        );
        let mismatch = TusError::ChecksumMismatch {
            algorithm: "sha256",
            declared: "aa".into(),
            computed: "bb".into(),
        };
        assert_eq!(mismatch.status_code().as_u16(), 460);
        assert_eq!(
            TusError::UnprocessableChunk("io".into()).status_code().as_u16(),
            422
        );
    }

    #[test]
    fn test_error_classes() {
        let mismatch = TusError::ChecksumMismatch {
            algorithm: "sha1",
            declared: "aa".into(),
            computed: "bb".into(),
        };
        assert_eq!(mismatch.class(), ErrorClass::IntegrityFailure);
        assert!(!mismatch.class().retryable());

        let io = TusError::UnprocessableChunk("disk full".into());
        assert!(io.class().retryable());

        let too_large = TusError::PayloadTooLarge { size: 10, max: 5 };
        assert_eq!(too_large.class(), ErrorClass::ResourceBoundary);
        assert!(!too_large.class().retryable());
    }

    #[test]
    fn test_version_mismatch_response_advertises_version() {
        let response = TusError::VersionMismatch("0.2.0".into()).into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(response.headers().get("Tus-Version").unwrap(), TUS_VERSION);
    }
}

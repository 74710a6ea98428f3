//! Upload types for the tus protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checksum::Checksum;
use super::metadata::Metadata;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version spoken by this server
pub const TUS_VERSION: &str = "1.0.0";

/// Protocol extensions implemented by this server
pub const TUS_EXTENSIONS: &[&str] = &["creation", "checksum", "expiration"];

/// Media type required on chunk requests
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// Longest accepted client-supplied upload key
pub const MAX_KEY_LENGTH: usize = 128;

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state, persisted as one record per upload key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Upload key
    pub key: String,

    /// Locator of the backing byte sink
    pub storage_path: String,

    /// Declared final length in bytes
    pub total_size: u64,

    /// Bytes committed so far
    pub offset: u64,

    /// Client-supplied metadata
    pub metadata: Metadata,

    /// Declared checksum of the complete upload
    pub checksum: Option<Checksum>,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Session expiry time
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if all bytes have been received
    pub fn is_complete(&self) -> bool {
        self.state() == SessionState::Completed
    }

    /// Current position in the session state machine
    pub fn state(&self) -> SessionState {
        if self.offset == self.total_size {
            SessionState::Completed
        } else if self.offset > self.total_size {
            SessionState::Overrun
        } else if self.offset == 0 {
            SessionState::Created
        } else {
            SessionState::InProgress
        }
    }
}

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No bytes received
    Created,
    /// Some bytes received
    InProgress,
    /// Offset reached the declared length
    Completed,
    /// A rejected chunk carried the offset past the declared length
    Overrun,
}

// ============================================================================
// Operation Types
// ============================================================================

/// Parameters of a creation request
#[derive(Debug, Clone, Default)]
pub struct CreateUpload {
    /// Client-chosen key; generated when absent
    pub key: Option<String>,

    /// Declared final length
    pub total_size: u64,

    /// Parsed `Upload-Metadata`
    pub metadata: Metadata,

    /// Parsed `Upload-Checksum`
    pub checksum: Option<Checksum>,
}

/// Answer to a creation request
#[derive(Debug, Clone, Serialize)]
pub struct CreatedUpload {
    pub key: String,
    pub location: String,
    pub expires_at: DateTime<Utc>,
}

/// Answer to a status inquiry
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub total_size: u64,
    pub offset: u64,
    pub metadata: Metadata,
    pub expires_at: DateTime<Utc>,
}

/// Answer to an accepted chunk
#[derive(Debug, Clone, Serialize)]
pub struct ChunkAccepted {
    pub offset: u64,
    pub expires_at: DateTime<Utc>,
    pub completed: bool,
}

/// Notification emitted once an upload is complete and verified
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadComplete {
    pub key: String,
    pub location: String,
    pub storage_path: String,
    pub size: u64,
    pub metadata: Metadata,
}

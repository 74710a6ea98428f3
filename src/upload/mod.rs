//! Resumable Upload Module (tus 1.0.0)
//!
//! Implements the tus core protocol with the creation, checksum and
//! expiration extensions:
//! - Upload sessions persisted in a key-value store with expiry
//! - Append-only payload storage with all-or-nothing chunk writes
//! - End-to-end checksum verification once an upload is complete
//!
//! Protocol Flow:
//! 1. Client discovers capabilities (OPTIONS)
//! 2. Client creates an upload with its final length (POST)
//! 3. Client sends chunks at the server's offset (PATCH), checking
//!    progress after interruptions (HEAD)
//! 4. Server verifies the completed upload and announces it

pub mod capabilities;
pub mod checksum;
pub mod engine;
pub mod events;
pub mod lock;
pub mod metadata;
pub mod sink;
pub mod store;
pub mod types;

pub use capabilities::{describe_capabilities, Capabilities};
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use engine::{EngineSettings, UploadEngine};
pub use events::{BroadcastNotifier, LogNotifier, Notifier};
pub use metadata::{parse_checksum_header, parse_metadata, Metadata, MetadataValue};
pub use sink::{ByteSink, LocalFileSink, MemorySink};
pub use store::{Insertion, KvStore, MemoryKvStore, SessionStore, SqliteKvStore};
pub use types::*;

//! Upload Engine
//!
//! The session state machine behind the tus endpoints:
//! - creation (POST) allocates storage and persists a session at offset 0
//! - status (HEAD) reports the authoritative offset
//! - chunk application (PATCH) appends, persists, then checks bounds and
//!   integrity once the declared length is reached
//!
//! All work on one upload key runs under a key-scoped lock spanning
//! load -> append -> persist -> verify.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::checksum;
use super::events::Notifier;
use super::lock::KeyLocks;
use super::sink::ByteSink;
use super::store::{KvStore, SessionStore};
use super::types::{
    ChunkAccepted, CreateUpload, CreatedUpload, SessionState, UploadComplete, UploadSession,
    UploadStatus, MAX_KEY_LENGTH, OFFSET_CONTENT_TYPE, SESSION_EXPIRY_HOURS,
};
use crate::error::{Result, TusError};

// ============================================================================
// Settings
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Largest accepted `Upload-Length` (0 = unlimited)
    pub max_size: u64,

    /// Absolute URL of the upload collection, e.g. `http://host/files`
    pub base_url: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_size: 0,
            base_url: "http://localhost:3000/files".to_string(),
        }
    }
}

// ============================================================================
// Upload Engine
// ============================================================================

/// Implements session creation, status and chunk application
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<UploadEngineInner>,
}

struct UploadEngineInner {
    store: SessionStore,
    sink: Arc<dyn ByteSink>,
    notifier: Arc<dyn Notifier>,
    locks: KeyLocks,
    settings: EngineSettings,
}

impl UploadEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        sink: Arc<dyn ByteSink>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(UploadEngineInner {
                store: SessionStore::new(kv, sink.clone()),
                sink,
                notifier,
                locks: KeyLocks::default(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Client-facing URL of an upload
    pub fn location(&self, key: &str) -> String {
        format!("{}/{}", self.inner.settings.base_url.trim_end_matches('/'), key)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create a new upload session
    pub async fn create_session(&self, request: CreateUpload) -> Result<CreatedUpload> {
        let max_size = self.inner.settings.max_size;
        if max_size > 0 && request.total_size > max_size {
            return Err(TusError::PayloadTooLarge {
                size: request.total_size,
                max: max_size,
            });
        }

        let key = match request.key {
            Some(key) => {
                validate_key(&key)?;
                key
            }
            None => Uuid::new_v4().to_string(),
        };

        let _guard = self.inner.locks.lock(&key).await;

        let session = self
            .inner
            .store
            .create(
                &key,
                request.total_size,
                request.metadata,
                request.checksum,
                expiry_from_now(),
            )
            .await?;

        tracing::info!(
            key = %session.key,
            total_size = session.total_size,
            metadata_entries = session.metadata.len(),
            checksum = session.checksum.as_ref().map(|c| c.algorithm.name()),
            "Created upload session"
        );

        // A zero-length upload is complete as soon as it exists
        if session.is_complete() {
            self.finish(&session).await.map_err(narrow)?;
        }

        Ok(CreatedUpload {
            location: self.location(&session.key),
            key: session.key,
            expires_at: session.expires_at,
        })
    }

    /// Report the size and progress of an upload
    pub async fn get_status(&self, key: &str) -> Result<UploadStatus> {
        let session = self.inner.store.load(key).await?;

        Ok(UploadStatus {
            total_size: session.total_size,
            offset: session.offset,
            metadata: session.metadata,
            expires_at: session.expires_at,
        })
    }

    /// Apply one chunk to an upload
    ///
    /// `claimed_offset` is the raw `Upload-Offset` header, compared textually
    /// against the session offset.
    pub async fn apply_chunk(
        &self,
        key: &str,
        claimed_offset: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<ChunkAccepted> {
        let _guard = self.inner.locks.lock(key).await;

        let mut session = self.inner.store.load(key).await?;

        if let Some(claimed) = claimed_offset {
            if claimed != session.offset.to_string() {
                return Err(TusError::OffsetConflict {
                    claimed: claimed.to_string(),
                    actual: session.offset,
                });
            }
        }

        if content_type != Some(OFFSET_CONTENT_TYPE) {
            return Err(TusError::UnsupportedMediaType(
                content_type.unwrap_or("none").to_string(),
            ));
        }

        // Empty PATCH against a finished upload: nothing to commit or announce
        if session.state() == SessionState::Completed && body.is_empty() {
            return Ok(ChunkAccepted {
                offset: session.offset,
                expires_at: session.expires_at,
                completed: true,
            });
        }

        self.commit_chunk(&mut session, body).await.map_err(narrow)
    }

    /// Start background cleanup of expired sessions
    pub fn start_cleanup_task(self, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                match self.inner.store.purge_expired().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count = count, "Purged expired upload sessions"),
                    Err(e) => tracing::warn!("Failed to purge expired sessions: {}", e),
                }
            }
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn commit_chunk(
        &self,
        session: &mut UploadSession,
        body: &[u8],
    ) -> Result<ChunkAccepted> {
        let committed = session.offset;
        self.align_storage(session).await?;

        let length = match self.inner.sink.append(&session.storage_path, body).await {
            Ok(length) => length,
            Err(e) => {
                self.rollback(session, committed).await;
                return Err(TusError::WriteFailed(e.to_string()));
            }
        };

        session.offset += body.len() as u64;
        session.expires_at = expiry_from_now();

        if length != session.offset {
            tracing::error!(
                key = %session.key,
                offset = session.offset,
                stored = length,
                "Stored length differs from session offset"
            );
            self.rollback(session, committed).await;
            return Err(TusError::UnprocessableChunk(format!(
                "stored length {} does not match offset {}",
                length, session.offset
            )));
        }

        // Persist before any further validation so an appended chunk is
        // never forgotten
        if let Err(e) = self.inner.store.save(session).await {
            self.rollback(session, committed).await;
            return Err(e);
        }

        tracing::debug!(
            key = %session.key,
            chunk = body.len(),
            offset = session.offset,
            total_size = session.total_size,
            "Chunk committed"
        );

        if session.offset > session.total_size {
            // The overflowing chunk stays recorded; see DESIGN.md
            tracing::warn!(
                key = %session.key,
                offset = session.offset,
                total_size = session.total_size,
                "Chunk overran the declared upload length"
            );
            return Err(TusError::RangeExceeded {
                offset: session.offset,
                total: session.total_size,
            });
        }

        if session.is_complete() {
            self.finish(session).await?;
        }

        Ok(ChunkAccepted {
            offset: session.offset,
            expires_at: session.expires_at,
            completed: session.is_complete(),
        })
    }

    /// Bring the stored object back in line with the committed offset.
    ///
    /// Bytes past the offset were never acknowledged and are dropped; a
    /// shorter object cannot be repaired.
    async fn align_storage(&self, session: &UploadSession) -> Result<()> {
        let stored = self
            .inner
            .sink
            .len(&session.storage_path)
            .await
            .map_err(|e| TusError::WriteFailed(e.to_string()))?;

        if stored > session.offset {
            tracing::warn!(
                key = %session.key,
                offset = session.offset,
                stored = stored,
                "Dropping unacknowledged bytes past the session offset"
            );
            self.inner
                .sink
                .truncate(&session.storage_path, session.offset)
                .await
                .map_err(|e| TusError::WriteFailed(e.to_string()))?;
        } else if stored < session.offset {
            return Err(TusError::UnprocessableChunk(format!(
                "stored length {} is behind offset {}",
                stored, session.offset
            )));
        }

        Ok(())
    }

    /// Cut the stored object back to the last persisted offset
    async fn rollback(&self, session: &UploadSession, committed: u64) {
        if let Err(e) = self
            .inner
            .sink
            .truncate(&session.storage_path, committed)
            .await
        {
            tracing::error!(
                key = %session.key,
                offset = committed,
                "Failed to roll back chunk: {}",
                e
            );
        }
    }

    /// Verify a complete upload and announce it
    async fn finish(&self, session: &UploadSession) -> Result<()> {
        if let Some(declared) = &session.checksum {
            let computed = checksum::digest(
                self.inner.sink.as_ref(),
                &session.storage_path,
                declared.algorithm,
            )
            .await
            .map_err(|e| TusError::UnprocessableChunk(format!("digest failed: {}", e)))?;

            if let Err(e) = checksum::verify(declared, &computed) {
                tracing::warn!(key = %session.key, "Upload failed integrity check: {}", e);
                return Err(e);
            }
        }

        self.inner
            .notifier
            .emit(UploadComplete {
                key: session.key.clone(),
                location: self.location(&session.key),
                storage_path: session.storage_path.clone(),
                size: session.offset,
                metadata: session.metadata.clone(),
            })
            .await;

        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn expiry_from_now() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(SESSION_EXPIRY_HOURS)
}

/// Narrow unexpected failures to a generic unprocessable-chunk error
fn narrow(err: TusError) -> TusError {
    match err {
        e @ (TusError::RangeExceeded { .. }
        | TusError::ChecksumMismatch { .. }
        | TusError::UnprocessableChunk(_)) => e,
        other => TusError::UnprocessableChunk(other.to_string()),
    }
}

/// Client-supplied keys end up in URLs; keep them to a safe alphabet
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(TusError::InvalidUploadKey(format!(
            "length must be 1..={}",
            MAX_KEY_LENGTH
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TusError::InvalidUploadKey(key.to_string()));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SinkError, StoreError};
    use crate::upload::checksum::{compute_digest, Checksum, ChecksumAlgorithm};
    use crate::upload::events::BroadcastNotifier;
    use crate::upload::metadata::parse_metadata;
    use crate::upload::sink::{MemorySink, SinkReader};
    use crate::upload::store::{Insertion, MemoryKvStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        engine: UploadEngine,
        kv: MemoryKvStore,
        sink: MemorySink,
        events: tokio::sync::broadcast::Receiver<UploadComplete>,
    }

    fn harness(max_size: u64) -> Harness {
        let kv = MemoryKvStore::new();
        let sink = MemorySink::new();
        let notifier = BroadcastNotifier::default();
        let events = notifier.subscribe();

        let engine = UploadEngine::new(
            Arc::new(kv.clone()),
            Arc::new(sink.clone()),
            Arc::new(notifier),
            EngineSettings {
                max_size,
                base_url: "http://localhost:3000/files/".to_string(),
            },
        );

        Harness { engine, kv, sink, events }
    }

    fn create(total_size: u64) -> CreateUpload {
        CreateUpload {
            total_size,
            ..Default::default()
        }
    }

    async fn patch(
        engine: &UploadEngine,
        key: &str,
        offset: &str,
        body: &[u8],
    ) -> Result<ChunkAccepted> {
        engine
            .apply_chunk(key, Some(offset), Some(OFFSET_CONTENT_TYPE), body)
            .await
    }

    #[tokio::test]
    async fn test_create_then_status() {
        let h = harness(0);
        let created = h
            .engine
            .create_session(CreateUpload {
                total_size: 10,
                metadata: parse_metadata("filename Zm9v"),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            created.location,
            format!("http://localhost:3000/files/{}", created.key)
        );

        let status = h.engine.get_status(&created.key).await.unwrap();
        assert_eq!(status.offset, 0);
        assert_eq!(status.total_size, 10);
        assert_eq!(status.metadata.get_str("filename"), Some("foo"));
        assert_eq!(status.expires_at, created.expires_at);
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_upload() {
        let h = harness(5);
        let result = h.engine.create_session(create(6)).await;
        assert!(matches!(result, Err(TusError::PayloadTooLarge { size: 6, max: 5 })));
        assert!(h.kv.is_empty());

        assert!(h.engine.create_session(create(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_with_client_key() {
        let h = harness(0);
        let created = h
            .engine
            .create_session(CreateUpload {
                key: Some("my-upload_1".to_string()),
                total_size: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(created.key, "my-upload_1");

        let duplicate = h
            .engine
            .create_session(CreateUpload {
                key: Some("my-upload_1".to_string()),
                total_size: 3,
                ..Default::default()
            })
            .await;
        assert!(matches!(duplicate, Err(TusError::SessionExists(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_unsafe_key() {
        let h = harness(0);
        let too_long = "x".repeat(MAX_KEY_LENGTH + 1);
        for key in ["", "../etc", "a b", too_long.as_str()] {
            let result = h
                .engine
                .create_session(CreateUpload {
                    key: Some(key.to_string()),
                    total_size: 1,
                    ..Default::default()
                })
                .await;
            assert!(matches!(result, Err(TusError::InvalidUploadKey(_))), "{key}");
        }
    }

    #[tokio::test]
    async fn test_generated_keys_are_unique() {
        let h = harness(0);
        let mut keys = HashSet::new();
        for _ in 0..50 {
            let created = h.engine.create_session(create(1)).await.unwrap();
            assert!(keys.insert(created.key));
        }
    }

    #[tokio::test]
    async fn test_concurrent_creation_with_distinct_keys() {
        let h = harness(0);
        let mut handles = Vec::new();
        for i in 0..16 {
            let engine = h.engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .create_session(CreateUpload {
                        key: Some(format!("upload-{i}")),
                        total_size: 4,
                        ..Default::default()
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(h.kv.len(), 16);
        assert_eq!(h.sink.object_count(), 16);
    }

    #[tokio::test]
    async fn test_hello_world_upload() {
        let mut h = harness(0);
        let created = h
            .engine
            .create_session(CreateUpload {
                total_size: 10,
                metadata: parse_metadata("filename aGVsbG8udHh0"),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = patch(&h.engine, &created.key, "0", b"hello").await.unwrap();
        assert_eq!(first.offset, 5);
        assert!(!first.completed);
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));

        let second = patch(&h.engine, &created.key, "5", b"world").await.unwrap();
        assert_eq!(second.offset, 10);
        assert!(second.completed);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.key, created.key);
        assert_eq!(event.location, created.location);
        assert_eq!(event.size, 10);
        assert_eq!(event.metadata.get_str("filename"), Some("hello.txt"));
        assert_eq!(h.sink.contents(&event.storage_path).unwrap(), b"helloworld");

        // Exactly one notification
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_upload_with_matching_checksum() {
        let mut h = harness(0);
        let created = h
            .engine
            .create_session(CreateUpload {
                total_size: 10,
                checksum: Some(Checksum {
                    algorithm: ChecksumAlgorithm::Sha256,
                    digest: compute_digest(ChecksumAlgorithm::Sha256, b"helloworld"),
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        patch(&h.engine, &created.key, "0", b"hello").await.unwrap();
        let done = patch(&h.engine, &created.key, "5", b"world").await.unwrap();
        assert!(done.completed);
        assert_eq!(h.events.try_recv().unwrap().size, 10);
    }

    #[tokio::test]
    async fn test_upload_with_mismatched_checksum() {
        let mut h = harness(0);
        let created = h
            .engine
            .create_session(CreateUpload {
                total_size: 10,
                checksum: Some(Checksum {
                    algorithm: ChecksumAlgorithm::Sha1,
                    digest: compute_digest(ChecksumAlgorithm::Sha1, b"helloworld"),
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        patch(&h.engine, &created.key, "0", b"hello").await.unwrap();
        let result = patch(&h.engine, &created.key, "5", b"worle").await;

        let err = result.unwrap_err();
        assert!(matches!(err, TusError::ChecksumMismatch { .. }));
        assert_eq!(err.status_code().as_u16(), 460);
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));

        // The chunk was persisted before verification ran
        let status = h.engine.get_status(&created.key).await.unwrap();
        assert_eq!(status.offset, 10);
        assert_eq!(status.total_size, 10);
    }

    #[tokio::test]
    async fn test_stale_offset_conflicts_without_mutation() {
        let h = harness(0);
        let created = h.engine.create_session(create(10)).await.unwrap();
        patch(&h.engine, &created.key, "0", b"hello").await.unwrap();

        // Retried first chunk
        let result = patch(&h.engine, &created.key, "0", b"hello").await;
        assert!(matches!(
            result,
            Err(TusError::OffsetConflict { actual: 5, .. })
        ));

        // Textual comparison: "05" is not "5"
        let result = patch(&h.engine, &created.key, "05", b"world").await;
        assert!(matches!(result, Err(TusError::OffsetConflict { .. })));

        assert_eq!(h.engine.get_status(&created.key).await.unwrap().offset, 5);
    }

    #[tokio::test]
    async fn test_missing_offset_header_is_accepted() {
        let h = harness(0);
        let created = h.engine.create_session(create(4)).await.unwrap();
        let accepted = h
            .engine
            .apply_chunk(&created.key, None, Some(OFFSET_CONTENT_TYPE), b"abcd")
            .await
            .unwrap();
        assert_eq!(accepted.offset, 4);
    }

    #[tokio::test]
    async fn test_wrong_content_type() {
        let h = harness(0);
        let created = h.engine.create_session(create(4)).await.unwrap();

        for content_type in [None, Some("application/octet-stream")] {
            let result = h
                .engine
                .apply_chunk(&created.key, Some("0"), content_type, b"abcd")
                .await;
            assert!(matches!(result, Err(TusError::UnsupportedMediaType(_))));
        }
        assert_eq!(h.engine.get_status(&created.key).await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_overflow_is_committed_then_rejected() {
        let mut h = harness(0);
        let created = h.engine.create_session(create(10)).await.unwrap();
        patch(&h.engine, &created.key, "0", b"hello").await.unwrap();

        let result = patch(&h.engine, &created.key, "5", b"world!!").await;
        assert!(matches!(
            result,
            Err(TusError::RangeExceeded { offset: 12, total: 10 })
        ));

        // The overflowing chunk is still recorded
        assert_eq!(h.engine.get_status(&created.key).await.unwrap().offset, 12);
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unknown_and_expired_sessions() {
        let h = harness(0);
        assert!(matches!(
            h.engine.get_status("missing").await,
            Err(TusError::SessionNotFound(_))
        ));
        assert!(matches!(
            patch(&h.engine, "missing", "0", b"x").await,
            Err(TusError::SessionNotFound(_))
        ));

        let created = h.engine.create_session(create(10)).await.unwrap();
        let store = SessionStore::new(Arc::new(h.kv.clone()), Arc::new(h.sink.clone()));
        let mut session = store.load(&created.key).await.unwrap();
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.save(&session).await.unwrap();

        assert!(matches!(
            h.engine.get_status(&created.key).await,
            Err(TusError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_refreshes_expiry() {
        let h = harness(0);
        let created = h.engine.create_session(create(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let accepted = patch(&h.engine, &created.key, "0", b"hello").await.unwrap();
        assert!(accepted.expires_at > created.expires_at);
        assert_eq!(
            h.engine.get_status(&created.key).await.unwrap().expires_at,
            accepted.expires_at
        );
    }

    #[tokio::test]
    async fn test_empty_patch_on_completed_upload_is_idempotent() {
        let mut h = harness(0);
        let created = h.engine.create_session(create(3)).await.unwrap();
        patch(&h.engine, &created.key, "0", b"abc").await.unwrap();
        h.events.try_recv().unwrap();

        let again = patch(&h.engine, &created.key, "3", b"").await.unwrap();
        assert_eq!(again.offset, 3);
        assert!(again.completed);
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_zero_length_upload_completes_on_creation() {
        let mut h = harness(0);
        let created = h.engine.create_session(create(0)).await.unwrap();

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.key, created.key);
        assert_eq!(event.size, 0);
    }

    #[tokio::test]
    async fn test_concurrent_chunks_for_same_key() {
        let h = harness(0);
        let created = h.engine.create_session(create(8)).await.unwrap();

        // Both claim offset 0; exactly one may win
        let (a, b) = tokio::join!(
            patch(&h.engine, &created.key, "0", b"aaaa"),
            patch(&h.engine, &created.key, "0", b"bbbb"),
        );
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(h.engine.get_status(&created.key).await.unwrap().offset, 4);
    }

    /// Sink whose appends always fail
    struct BrokenSink(MemorySink);

    #[async_trait::async_trait]
    impl ByteSink for BrokenSink {
        async fn allocate(&self, key: &str) -> Result<String, SinkError> {
            self.0.allocate(key).await
        }

        async fn append(&self, _storage_path: &str, _data: &[u8]) -> Result<u64, SinkError> {
            Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn len(&self, storage_path: &str) -> Result<u64, SinkError> {
            self.0.len(storage_path).await
        }

        async fn truncate(&self, storage_path: &str, len: u64) -> Result<(), SinkError> {
            self.0.truncate(storage_path, len).await
        }

        async fn open(&self, storage_path: &str) -> Result<SinkReader, SinkError> {
            self.0.open(storage_path).await
        }

        async fn remove(&self, storage_path: &str) -> Result<(), SinkError> {
            self.0.remove(storage_path).await
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_narrowed_and_keeps_offset() {
        let engine = UploadEngine::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(BrokenSink(MemorySink::new())),
            Arc::new(BroadcastNotifier::default()),
            EngineSettings::default(),
        );
        let created = engine.create_session(create(4)).await.unwrap();

        let err = patch(&engine, &created.key, "0", b"abcd").await.unwrap_err();
        assert!(matches!(err, TusError::UnprocessableChunk(_)));
        assert_eq!(err.status_code().as_u16(), 422);
        assert_eq!(engine.get_status(&created.key).await.unwrap().offset, 0);
    }

    /// Store whose next `set` calls fail
    #[derive(Clone, Default)]
    struct FlakyKv {
        inner: MemoryKvStore,
        failing_sets: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl KvStore for FlakyKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: Vec<u8>,
            expires_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let armed = self
                .failing_sets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if armed {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.set(key, value, expires_at).await
        }

        async fn insert_if_absent(
            &self,
            key: &str,
            value: Vec<u8>,
            expires_at: DateTime<Utc>,
        ) -> Result<Insertion, StoreError> {
            self.inner.insert_if_absent(key, value, expires_at).await
        }

        async fn purge_expired(&self) -> Result<Vec<Vec<u8>>, StoreError> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_appended_chunk() {
        let kv = FlakyKv::default();
        let sink = MemorySink::new();
        let notifier = BroadcastNotifier::default();
        let mut events = notifier.subscribe();
        let engine = UploadEngine::new(
            Arc::new(kv.clone()),
            Arc::new(sink.clone()),
            Arc::new(notifier),
            EngineSettings::default(),
        );
        let created = engine.create_session(create(10)).await.unwrap();
        let storage_path = SessionStore::new(Arc::new(kv.clone()), Arc::new(sink.clone()))
            .load(&created.key)
            .await
            .unwrap()
            .storage_path;

        kv.failing_sets.store(1, Ordering::SeqCst);
        let err = patch(&engine, &created.key, "0", b"hello").await.unwrap_err();
        assert!(matches!(err, TusError::UnprocessableChunk(_)));
        assert_eq!(sink.contents(&storage_path), Some(Vec::new()));
        assert_eq!(engine.get_status(&created.key).await.unwrap().offset, 0);

        // The client retries from the offset it was last told
        assert_eq!(patch(&engine, &created.key, "0", b"hello").await.unwrap().offset, 5);
        assert!(patch(&engine, &created.key, "5", b"world").await.unwrap().completed);

        assert_eq!(sink.contents(&storage_path), Some(b"helloworld".to_vec()));
        assert_eq!(events.try_recv().unwrap().size, 10);
    }

    #[tokio::test]
    async fn test_unacknowledged_bytes_are_dropped_before_append() {
        let h = harness(0);
        let created = h.engine.create_session(create(10)).await.unwrap();
        let store = SessionStore::new(Arc::new(h.kv.clone()), Arc::new(h.sink.clone()));
        let session = store.load(&created.key).await.unwrap();

        // Bytes that reached storage without their offset being recorded
        h.sink.append(&session.storage_path, b"junk").await.unwrap();

        patch(&h.engine, &created.key, "0", b"hello").await.unwrap();
        assert_eq!(h.sink.contents(&session.storage_path), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_storage_behind_offset_is_unprocessable() {
        let h = harness(0);
        let created = h.engine.create_session(create(10)).await.unwrap();
        let store = SessionStore::new(Arc::new(h.kv.clone()), Arc::new(h.sink.clone()));
        let mut session = store.load(&created.key).await.unwrap();
        session.offset = 3;
        store.save(&session).await.unwrap();

        let err = patch(&h.engine, &created.key, "3", b"lo").await.unwrap_err();
        assert!(matches!(err, TusError::UnprocessableChunk(_)));
        assert_eq!(h.engine.get_status(&created.key).await.unwrap().offset, 3);
        assert_eq!(h.sink.contents(&session.storage_path), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_cleanup_task_purges_expired_sessions() {
        let h = harness(0);
        let created = h.engine.create_session(create(10)).await.unwrap();

        let store = SessionStore::new(Arc::new(h.kv.clone()), Arc::new(h.sink.clone()));
        let mut session = store.load(&created.key).await.unwrap();
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.save(&session).await.unwrap();

        let task = h.engine.clone().start_cleanup_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();

        assert!(h.kv.is_empty());
        assert_eq!(h.sink.object_count(), 0);
    }
}

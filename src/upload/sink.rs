//! Byte Sink
//!
//! Append-only storage for upload payloads. Supports a local filesystem
//! backend and an in-memory backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::lock::KeyLocks;
use crate::error::SinkError;

// ============================================================================
// Byte Sink Trait
// ============================================================================

/// Reader over the stored content of one upload
pub type SinkReader = Box<dyn AsyncRead + Send + Unpin>;

/// Trait for append-only storage backends
#[async_trait::async_trait]
pub trait ByteSink: Send + Sync {
    /// Create a fresh, empty storage object and return its locator
    async fn allocate(&self, key: &str) -> Result<String, SinkError>;

    /// Append `data` to the end of the object and return its new length.
    ///
    /// Either all of `data` is appended or the object is left unchanged.
    async fn append(&self, storage_path: &str, data: &[u8]) -> Result<u64, SinkError>;

    /// Current length of the object
    async fn len(&self, storage_path: &str) -> Result<u64, SinkError>;

    /// Shrink the object to `len` bytes.
    ///
    /// No-op when the object is already at most `len` bytes long.
    async fn truncate(&self, storage_path: &str, len: u64) -> Result<(), SinkError>;

    /// Open the object for reading from the start
    async fn open(&self, storage_path: &str) -> Result<SinkReader, SinkError>;

    /// Delete the object
    async fn remove(&self, storage_path: &str) -> Result<(), SinkError>;
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem byte sink, one file per upload
pub struct LocalFileSink {
    base_path: PathBuf,
    locks: KeyLocks,
}

impl LocalFileSink {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            locks: KeyLocks::default(),
        }
    }

    /// Resolve a locator to a file inside the base directory
    pub fn resolve(&self, storage_path: &str) -> Result<PathBuf, SinkError> {
        let name = Path::new(storage_path);
        if storage_path.is_empty() || name.file_name() != Some(name.as_os_str()) {
            return Err(SinkError::InvalidPath(storage_path.to_string()));
        }
        Ok(self.base_path.join(name))
    }

    /// Write `data` through `writer`, cutting the file at `path` back to
    /// `before` bytes if any part of the write fails
    async fn write_or_rollback<W>(
        path: &Path,
        writer: &mut W,
        before: u64,
        data: &[u8],
    ) -> Result<(), SinkError>
    where
        W: AsyncWrite + Unpin,
    {
        let written = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Err(truncate_err) = shrink_file(path, before).await {
                tracing::error!(
                    path = %path.display(),
                    length = before,
                    "Failed to roll back partial append: {}",
                    truncate_err
                );
            }
            return Err(SinkError::Io(e));
        }

        Ok(())
    }
}

/// Shrink a file to `len` bytes, leaving shorter files untouched
async fn shrink_file(path: &Path, len: u64) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    if file.metadata().await?.len() > len {
        file.set_len(len).await?;
        file.sync_data().await?;
    }
    Ok(())
}

fn not_found(storage_path: &str, e: std::io::Error) -> SinkError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SinkError::NotFound(storage_path.to_string())
    } else {
        SinkError::Io(e)
    }
}

#[async_trait::async_trait]
impl ByteSink for LocalFileSink {
    async fn allocate(&self, key: &str) -> Result<String, SinkError> {
        tokio::fs::create_dir_all(&self.base_path).await?;

        // The key is client-controlled; the file name never is
        let storage_path = format!("{}.part", Uuid::new_v4().simple());
        let path = self.resolve(&storage_path)?;

        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        tracing::debug!(key = %key, path = %path.display(), "Allocated upload file");

        Ok(storage_path)
    }

    async fn append(&self, storage_path: &str, data: &[u8]) -> Result<u64, SinkError> {
        let path = self.resolve(storage_path)?;
        let _guard = self.locks.lock(storage_path).await;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| not_found(storage_path, e))?;

        let before = file.metadata().await?.len();

        Self::write_or_rollback(&path, &mut file, before, data).await?;
        file.sync_data().await?;

        Ok(before + data.len() as u64)
    }

    async fn len(&self, storage_path: &str) -> Result<u64, SinkError> {
        let path = self.resolve(storage_path)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found(storage_path, e))?;
        Ok(metadata.len())
    }

    async fn truncate(&self, storage_path: &str, len: u64) -> Result<(), SinkError> {
        let path = self.resolve(storage_path)?;
        let _guard = self.locks.lock(storage_path).await;

        shrink_file(&path, len)
            .await
            .map_err(|e| not_found(storage_path, e))
    }

    async fn open(&self, storage_path: &str) -> Result<SinkReader, SinkError> {
        let path = self.resolve(storage_path)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(storage_path, e))?;
        Ok(Box::new(file))
    }

    async fn remove(&self, storage_path: &str) -> Result<(), SinkError> {
        let path = self.resolve(storage_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::Io(e)),
        }
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory byte sink
#[derive(Clone, Default)]
pub struct MemorySink {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of an object's content
    pub fn contents(&self, storage_path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(storage_path).cloned()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait::async_trait]
impl ByteSink for MemorySink {
    async fn allocate(&self, key: &str) -> Result<String, SinkError> {
        let storage_path = format!("{}-{}", key, Uuid::new_v4().simple());
        self.objects.lock().insert(storage_path.clone(), Vec::new());
        Ok(storage_path)
    }

    async fn append(&self, storage_path: &str, data: &[u8]) -> Result<u64, SinkError> {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(storage_path)
            .ok_or_else(|| SinkError::NotFound(storage_path.to_string()))?;
        object.extend_from_slice(data);
        Ok(object.len() as u64)
    }

    async fn len(&self, storage_path: &str) -> Result<u64, SinkError> {
        self.objects
            .lock()
            .get(storage_path)
            .map(|object| object.len() as u64)
            .ok_or_else(|| SinkError::NotFound(storage_path.to_string()))
    }

    async fn truncate(&self, storage_path: &str, len: u64) -> Result<(), SinkError> {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(storage_path)
            .ok_or_else(|| SinkError::NotFound(storage_path.to_string()))?;
        object.truncate(usize::try_from(len).unwrap_or(usize::MAX));
        Ok(())
    }

    async fn open(&self, storage_path: &str) -> Result<SinkReader, SinkError> {
        let data = self
            .contents(storage_path)
            .ok_or_else(|| SinkError::NotFound(storage_path.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn remove(&self, storage_path: &str) -> Result<(), SinkError> {
        self.objects.lock().remove(storage_path);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

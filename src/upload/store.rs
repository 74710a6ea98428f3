//! Session Store
//!
//! Upload sessions are kept as JSON records in a key-value store with
//! per-entry expiry. Expired entries are never returned.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::checksum::Checksum;
use super::metadata::Metadata;
use super::sink::ByteSink;
use super::types::UploadSession;
use crate::error::{Result, StoreError, TusError};

// ============================================================================
// Key-Value Store Trait
// ============================================================================

/// Key-value store with absolute per-entry expiry
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Get a live value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Upsert a value, replacing its expiry
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Insert a value unless a live entry already holds the key
    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<Insertion, StoreError>;

    /// Remove expired entries, returning their values
    async fn purge_expired(&self) -> Result<Vec<Vec<u8>>, StoreError>;
}

/// Outcome of [`KvStore::insert_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// Stored; carries the expired value that was overwritten, if any
    Inserted(Option<Vec<u8>>),
    /// A live entry holds the key
    Taken,
}

// ============================================================================
// In-Memory Store
// ============================================================================

struct Entry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// In-memory key-value store
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Utc::now();
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<Insertion, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(Insertion::Taken);
        }
        let replaced = entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(Insertion::Inserted(replaced.map(|entry| entry.value)))
    }

    async fn purge_expired(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write();

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();

        Ok(expired
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .map(|entry| entry.value)
            .collect())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed key-value store
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Connect and create the schema
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // Every connection to an in-memory database is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the session table
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_upload_sessions_expires
                ON upload_sessions(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM upload_sessions WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<Insertion, StoreError> {
        let now = Utc::now().timestamp_millis();

        // A concurrent sweep may purge this row first; removing its
        // storage twice is harmless
        let replaced: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM upload_sessions WHERE key = ? AND expires_at <= ?",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE upload_sessions.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Insertion::Inserted(replaced.map(|(value,)| value)))
        } else {
            Ok(Insertion::Taken)
        }
    }

    async fn purge_expired(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM upload_sessions WHERE expires_at <= ?")
                .bind(now)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM upload_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(rows.into_iter().map(|(value,)| value).collect())
    }
}

// ============================================================================
// Session Store Adapter
// ============================================================================

/// Loads, saves and creates upload sessions on top of a [`KvStore`]
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    sink: Arc<dyn ByteSink>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, sink: Arc<dyn ByteSink>) -> Self {
        Self { kv, sink }
    }

    /// Load a live session
    pub async fn load(&self, key: &str) -> Result<UploadSession> {
        let value = self
            .kv
            .get(key)
            .await?
            .ok_or_else(|| TusError::SessionNotFound(key.to_string()))?;

        let session: UploadSession = serde_json::from_slice(&value).map_err(StoreError::from)?;

        // Stores with coarse expiry may still hand back a stale record
        if session.is_expired() {
            return Err(TusError::SessionNotFound(key.to_string()));
        }

        Ok(session)
    }

    /// Upsert a session, resetting its store expiry to `expires_at`
    pub async fn save(&self, session: &UploadSession) -> Result<()> {
        let value = serde_json::to_vec(session).map_err(StoreError::from)?;
        self.kv.set(&session.key, value, session.expires_at).await?;
        Ok(())
    }

    /// Allocate storage and persist a new session with offset 0
    pub async fn create(
        &self,
        key: &str,
        total_size: u64,
        metadata: Metadata,
        checksum: Option<Checksum>,
        expires_at: DateTime<Utc>,
    ) -> Result<UploadSession> {
        let storage_path = self
            .sink
            .allocate(key)
            .await
            .map_err(|e| TusError::StorageAllocationFailed(e.to_string()))?;

        let session = UploadSession {
            key: key.to_string(),
            storage_path,
            total_size,
            offset: 0,
            metadata,
            checksum,
            created_at: Utc::now(),
            expires_at,
        };

        let value = serde_json::to_vec(&session).map_err(StoreError::from)?;
        match self.kv.insert_if_absent(key, value, expires_at).await {
            Ok(Insertion::Inserted(replaced)) => {
                if let Some(previous) = replaced {
                    self.discard_session(&previous).await;
                }
                Ok(session)
            }
            Ok(Insertion::Taken) => {
                self.discard_storage(&session.storage_path).await;
                Err(TusError::SessionExists(key.to_string()))
            }
            Err(e) => {
                self.discard_storage(&session.storage_path).await;
                Err(e.into())
            }
        }
    }

    /// Remove expired sessions and their storage
    ///
    /// Returns the number of sessions purged.
    pub async fn purge_expired(&self) -> Result<usize> {
        let expired = self.kv.purge_expired().await?;
        let count = expired.len();

        for value in expired {
            self.discard_session(&value).await;
        }

        Ok(count)
    }

    /// Release the storage of an expired session record
    async fn discard_session(&self, value: &[u8]) {
        match serde_json::from_slice::<UploadSession>(value) {
            Ok(session) => {
                self.discard_storage(&session.storage_path).await;
                tracing::debug!(key = %session.key, "Discarded expired upload session");
            }
            Err(e) => tracing::warn!("Skipping undecodable expired session: {}", e),
        }
    }

    async fn discard_storage(&self, storage_path: &str) {
        if let Err(e) = self.sink.remove(storage_path).await {
            tracing::warn!(storage_path = %storage_path, "Failed to remove upload storage: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

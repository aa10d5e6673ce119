//! Best-effort local cache
//!
//! Holds the last-known-good copy of each tracked collection. The cache is a
//! fallback, never a source of truth: failed writes are logged and dropped,
//! failed reads come back as absent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RoundingError, RoundingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheCollection {
    Patients,
    OnCallSchedule,
    Settings,
}

impl CacheCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCollection::Patients => "patients",
            CacheCollection::OnCallSchedule => "onCallSchedule",
            CacheCollection::Settings => "settings",
        }
    }
}

/// One cached collection snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub collection: CacheCollection,
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

/// Durable storage behind [`LocalCache`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Replace the stored entry for the entry's collection.
    async fn write(&self, entry: &CacheEntry) -> RoundingResult<()>;

    async fn read(&self, collection: CacheCollection) -> RoundingResult<Option<CacheEntry>>;
}

/// SQLite file cache; survives process restarts
pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    /// Open (creating if needed) the cache database at `path`.
    ///
    /// # Errors
    ///
    /// `Cache` when the file cannot be opened or the schema cannot be created.
    pub async fn open(path: &Path) -> RoundingResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                collection TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                captured_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        tracing::debug!(path = %path.display(), "Opened local cache");
        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn write(&self, entry: &CacheEntry) -> RoundingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (collection, payload, captured_at)
            VALUES (?, ?, ?)
            ON CONFLICT(collection) DO UPDATE SET
                payload = excluded.payload,
                captured_at = excluded.captured_at
            "#,
        )
        .bind(entry.collection.as_str())
        .bind(serde_json::to_string(&entry.payload)?)
        .bind(entry.captured_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read(&self, collection: CacheCollection) -> RoundingResult<Option<CacheEntry>> {
        let row = sqlx::query("SELECT payload, captured_at FROM cache_entries WHERE collection = ?")
            .bind(collection.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload")?;
        let captured_at: String = row.try_get("captured_at")?;
        let captured_at = DateTime::parse_from_rfc3339(&captured_at)
            .map_err(|e| RoundingError::Cache(format!("Bad capture timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(CacheEntry {
            collection,
            payload: serde_json::from_str(&payload)?,
            captured_at,
        }))
    }
}

/// Process-local cache backend with an availability switch
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<CacheCollection, CacheEntry>>,
    unavailable: AtomicBool,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate storage that refuses reads and writes (quota, privacy mode).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> RoundingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RoundingError::Cache("Storage unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn write(&self, entry: &CacheEntry) -> RoundingResult<()> {
        self.check()?;
        self.entries.lock().insert(entry.collection, entry.clone());
        Ok(())
    }

    async fn read(&self, collection: CacheCollection) -> RoundingResult<Option<CacheEntry>> {
        self.check()?;
        Ok(self.entries.lock().get(&collection).cloned())
    }
}

/// Front door used by the sync engine
#[derive(Clone)]
pub struct LocalCache {
    backend: Option<Arc<dyn CacheBackend>>,
}

impl LocalCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend: Some(backend) }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    /// SQLite cache at `path`, or a disabled cache when it cannot be opened.
    pub async fn open_sqlite(path: &Path) -> Self {
        match SqliteCacheBackend::open(path).await {
            Ok(backend) => Self::new(Arc::new(backend)),
            Err(e) => {
                tracing::warn!(error = %e, "Local cache unavailable, continuing without it");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Overwrite the cached copy of `collection`. Never fails.
    pub async fn put<T: Serialize + ?Sized>(&self, collection: CacheCollection, payload: &T) {
        let Some(backend) = &self.backend else { return };

        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(collection = collection.as_str(), error = %e, "Failed to serialize cache payload");
                return;
            }
        };
        let entry = CacheEntry {
            collection,
            payload,
            captured_at: Utc::now(),
        };
        if let Err(e) = backend.write(&entry).await {
            tracing::warn!(collection = collection.as_str(), error = %e, "Cache write failed");
        }
    }

    /// Raw entry including its capture time; `None` when absent or unreadable.
    pub async fn get_entry(&self, collection: CacheCollection) -> Option<CacheEntry> {
        let backend = self.backend.as_ref()?;
        match backend.read(collection).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(collection = collection.as_str(), error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Last cached payload decoded as `T`.
    pub async fn get<T: DeserializeOwned>(&self, collection: CacheCollection) -> Option<T> {
        self.get_timed(collection).await.map(|(value, _)| value)
    }

    /// Last cached payload with the time it was captured.
    pub async fn get_timed<T: DeserializeOwned>(&self, collection: CacheCollection) -> Option<(T, DateTime<Utc>)> {
        let entry = self.get_entry(collection).await?;
        match serde_json::from_value(entry.payload) {
            Ok(value) => Some((value, entry.captured_at)),
            Err(e) => {
                tracing::warn!(collection = collection.as_str(), error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }
}

//! Durable secondary tier for [`ResultCache`](super::ResultCache)
//!
//! Entries live in a separate SQLite file so cache churn never contends
//! with the knowledge-base writer. Keys are stored under their blake3 hash;
//! the original key is kept alongside for pattern invalidation.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use thiserror::Error;

use super::Priority;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An entry as persisted by a backend. `value` is always the uncompressed
/// JSON encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    /// Unix milliseconds
    pub created_at_ms: i64,
    pub ttl_ms: u64,
    pub tags: Vec<String>,
    pub priority: Priority,
}

impl StoredEntry {
    /// Age relative to `now_ms`, `None` once past its TTL
    pub fn remaining_age(&self, now_ms: i64) -> Option<Duration> {
        let age = now_ms.saturating_sub(self.created_at_ms).max(0) as u64;
        (age < self.ttl_ms).then(|| Duration::from_millis(age))
    }
}

/// Storage behind the in-memory cache.
///
/// Object-safe so the cache can hold `Arc<dyn CacheBackend>`.
pub trait CacheBackend: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, CacheError>>;

    fn put<'a>(&'a self, key: &'a str, entry: StoredEntry) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove entries whose key matches `pattern` or that carry any of
    /// `tags`. Returns the removed keys.
    fn invalidate<'a>(
        &'a self,
        pattern: Option<&'a Regex>,
        tags: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<String>, CacheError>>;

    fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>>;
}

const CACHE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key_hash TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    compressed INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL,
    tags TEXT NOT NULL,
    priority INTEGER NOT NULL
)";

/// SQLite-file cache tier with optional gzip compression
pub struct SqliteCacheBackend {
    pool: SqlitePool,
    path: PathBuf,
    compress: bool,
}

impl SqliteCacheBackend {
    /// Open (creating if needed) the cache file and drop expired rows.
    pub async fn open(path: &Path, compress: bool) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(2));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .idle_timeout(Duration::from_secs(300))
            .connect_with(opts)
            .await?;
        sqlx::query(CACHE_SCHEMA).execute(&pool).await?;

        let purged = sqlx::query("DELETE FROM cache_entries WHERE created_at + ttl_ms <= ?1")
            .bind(now_ms())
            .execute(&pool)
            .await?
            .rows_affected();
        tracing::debug!(path = %path.display(), compress, purged, "Cache backend opened");

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            compress,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows on disk, expired or not
    pub async fn len(&self) -> Result<u64, CacheError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn get_impl(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let row = sqlx::query(
            "SELECT value, compressed, created_at, ttl_ms, tags, priority
             FROM cache_entries WHERE key_hash = ?1",
        )
        .bind(hash_key(key))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };

        let raw: Vec<u8> = row.try_get(0)?;
        let compressed: bool = row.try_get::<i64, _>(1)? != 0;
        let value = if compressed { gunzip(&raw)? } else { raw };
        let tags: String = row.try_get(4)?;
        Ok(Some(StoredEntry {
            value,
            created_at_ms: row.try_get(2)?,
            ttl_ms: row.try_get::<i64, _>(3)?.max(0) as u64,
            tags: serde_json::from_str(&tags)?,
            priority: Priority::from_level(row.try_get(5)?),
        }))
    }

    async fn put_impl(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let (value, compressed) = if self.compress {
            (gzip(&entry.value)?, true)
        } else {
            (entry.value, false)
        };
        sqlx::query(
            "INSERT OR REPLACE INTO cache_entries
             (key_hash, key, value, compressed, created_at, ttl_ms, tags, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(hash_key(key))
        .bind(key)
        .bind(value)
        .bind(compressed as i64)
        .bind(entry.created_at_ms)
        .bind(entry.ttl_ms as i64)
        .bind(serde_json::to_string(&entry.tags)?)
        .bind(entry.priority.level())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_impl(
        &self,
        pattern: Option<&Regex>,
        tags: &[String],
    ) -> Result<Vec<String>, CacheError> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT key_hash, key, tags FROM cache_entries")
                .fetch_all(&self.pool)
                .await?;

        let everything = pattern.is_none() && tags.is_empty();
        let mut removed = Vec::new();
        let mut tx = self.pool.begin().await?;
        for (hash, key, row_tags) in rows {
            let row_tags: Vec<String> = serde_json::from_str(&row_tags).unwrap_or_default();
            let hit = everything
                || pattern.is_some_and(|p| p.is_match(&key))
                || row_tags.iter().any(|t| tags.contains(t));
            if hit {
                sqlx::query("DELETE FROM cache_entries WHERE key_hash = ?1")
                    .bind(&hash)
                    .execute(&mut *tx)
                    .await?;
                removed.push(key);
            }
        }
        tx.commit().await?;
        Ok(removed)
    }
}

impl CacheBackend for SqliteCacheBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, CacheError>> {
        self.get_impl(key).boxed()
    }

    fn put<'a>(&'a self, key: &'a str, entry: StoredEntry) -> BoxFuture<'a, Result<(), CacheError>> {
        self.put_impl(key, entry).boxed()
    }

    fn invalidate<'a>(
        &'a self,
        pattern: Option<&'a Regex>,
        tags: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        self.invalidate_impl(pattern, tags).boxed()
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>> {
        async move {
            sqlx::query("DELETE FROM cache_entries")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }
}

fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

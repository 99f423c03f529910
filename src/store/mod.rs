//! SQLite storage for knowledge-base entries (sqlx async)
//!
//! The store itself is just a file; connections are owned by the
//! [`ConnectionPool`](crate::pool::ConnectionPool), which opens them through
//! [`SqliteManager`]. This module provides:
//!
//! - `helpers` - Row types, `StoreError`, schema version
//! - `entries` - Entry writes (insert, usage counters, archive) and lookups

mod entries;

/// Helper types and row conversion.
///
/// `pub(crate)` - external consumers use the re-exports below.
pub(crate) mod helpers;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};

use crate::pool::{ConnectionManager, Role};

/// Summary of a knowledge-base entry returned from search.
pub use helpers::EntrySummary;

/// Fields for creating an entry.
pub use helpers::NewEntry;

/// Entry and facet counts.
pub use helpers::StoreStats;

/// Store operation errors.
pub use helpers::StoreError;

/// Outcome recorded against an entry.
pub use helpers::UsageOutcome;

/// Current database schema version.
pub use helpers::CURRENT_SCHEMA_VERSION;

pub use entries::{archive_entry, get_entry, insert_entry, record_usage, store_stats};

/// Opens reader and writer connections to a single SQLite file.
///
/// Readers are opened read-only. Only the writer may create the file, so the
/// writer must connect (and [`init_schema`] run) before the first reader.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    enable_wal: bool,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub fn new(path: impl Into<PathBuf>, enable_wal: bool) -> Self {
        Self {
            path: path.into(),
            enable_wal,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wal_enabled(&self) -> bool {
        self.enable_wal
    }

    fn connect_options(&self, role: Role) -> SqliteConnectOptions {
        // filename() avoids URL parsing issues with special characters in paths
        let journal_mode = if self.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let opts = SqliteConnectOptions::new()
            .filename(&self.path)
            .foreign_keys(true)
            .journal_mode(journal_mode)
            .busy_timeout(self.busy_timeout)
            .synchronous(SqliteSynchronous::Normal)
            // 16MB page cache per connection (negative = KB)
            .pragma("cache_size", "-16384")
            .pragma("temp_store", "MEMORY");
        match role {
            Role::Writer => opts.create_if_missing(true),
            Role::Reader => opts.read_only(true),
        }
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = SqliteConnection;

    fn connect(
        &self,
        role: Role,
    ) -> impl Future<Output = Result<SqliteConnection, StoreError>> + Send {
        let opts = self.connect_options(role);
        let path = self.path.clone();
        async move {
            if role == Role::Writer {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = opts.connect().await?;
            tracing::debug!(path = %path.display(), ?role, "Store connection opened");
            Ok(conn)
        }
    }

    fn is_valid<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
    ) -> impl Future<Output = bool> + Send + 'a {
        async move { conn.ping().await.is_ok() }
    }

    fn close(&self, conn: SqliteConnection) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error closing store connection");
            }
        }
    }
}

/// Create tables and record the schema version.
///
/// Runs every statement in one transaction so a crash mid-init cannot leave
/// a partial schema. Idempotent: every statement is `IF NOT EXISTS`. A store
/// written by a newer schema is refused.
pub async fn init_schema(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    let existing = stored_schema_version(conn).await?;
    if existing > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaNewerThanSupported(existing));
    }

    let mut tx = conn.begin().await?;

    let schema = include_str!("../schema.sql");
    for statement in schema.split(';') {
        let stmt: String = statement
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        sqlx::query(stmt).execute(&mut *tx).await?;
    }

    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")
        .bind("schema_version")
        .bind(CURRENT_SCHEMA_VERSION.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)")
        .bind("created_at")
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")
        .bind("kbsearch_version")
        .bind(env!("CARGO_PKG_VERSION"))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(schema_version = CURRENT_SCHEMA_VERSION, "Schema initialized");
    Ok(())
}

/// Schema version stored in metadata, 0 for an uninitialized store.
pub async fn stored_schema_version(conn: &mut SqliteConnection) -> Result<i32, StoreError> {
    let row: Option<(String,)> =
        match sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_optional(&mut *conn)
            .await
        {
            Ok(r) => r,
            Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => {
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

    Ok(row
        .and_then(|(s,)| {
            s.parse()
                .map_err(|e| {
                    tracing::warn!(
                        stored_value = %s,
                        error = %e,
                        "Failed to parse schema_version from metadata, defaulting to 0"
                    );
                })
                .ok()
        })
        .unwrap_or(0))
}

/// `PRAGMA quick_check`, catches B-tree corruption early
pub async fn quick_check(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    let result: (String,) = sqlx::query_as("PRAGMA quick_check")
        .fetch_one(&mut *conn)
        .await?;
    if result.0 != "ok" {
        return Err(StoreError::Corruption(result.0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn writer(dir: &TempDir, wal: bool) -> (SqliteManager, SqliteConnection) {
        let manager = SqliteManager::new(dir.path().join("kb.db"), wal);
        let conn = manager.connect(Role::Writer).await.unwrap();
        (manager, conn)
    }

    #[tokio::test]
    async fn test_init_schema_records_version() {
        let dir = TempDir::new().unwrap();
        let (_, mut conn) = writer(&dir, true).await;
        assert_eq!(stored_schema_version(&mut conn).await.unwrap(), 0);
        init_schema(&mut conn).await.unwrap();
        assert_eq!(
            stored_schema_version(&mut conn).await.unwrap(),
            CURRENT_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_init_schema_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_, mut conn) = writer(&dir, true).await;
        init_schema(&mut conn).await.unwrap();
        init_schema(&mut conn).await.unwrap();
        quick_check(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_reinit_keeps_existing_entries() {
        let dir = TempDir::new().unwrap();
        let (_, mut conn) = writer(&dir, true).await;
        init_schema(&mut conn).await.unwrap();
        let id = insert_entry(&mut conn, &NewEntry::new("t", "p", "s", "JCL"))
            .await
            .unwrap();
        init_schema(&mut conn).await.unwrap();
        assert!(get_entry(&mut conn, &id).await.unwrap().is_some());
        assert_eq!(
            stored_schema_version(&mut conn).await.unwrap(),
            CURRENT_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_newer_schema_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, mut conn) = writer(&dir, true).await;
        init_schema(&mut conn).await.unwrap();
        sqlx::query("UPDATE metadata SET value = '99' WHERE key = 'schema_version'")
            .execute(&mut conn)
            .await
            .unwrap();
        let err = init_schema(&mut conn).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaNewerThanSupported(99)));
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let dir = TempDir::new().unwrap();
        let (_, mut conn) = writer(&dir, true).await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reader_is_read_only() {
        let dir = TempDir::new().unwrap();
        let (manager, mut conn) = writer(&dir, true).await;
        init_schema(&mut conn).await.unwrap();
        let mut reader = manager.connect(Role::Reader).await.unwrap();
        let result = sqlx::query("INSERT INTO metadata (key, value) VALUES ('x', 'y')")
            .execute(&mut reader)
            .await;
        assert!(result.is_err(), "reader connections must reject writes");
        assert!(manager.is_valid(&mut reader).await);
    }

    #[tokio::test]
    async fn test_all_tables_created() {
        let dir = TempDir::new().unwrap();
        let (_, mut conn) = writer(&dir, true).await;
        init_schema(&mut conn).await.unwrap();
        for table in ["metadata", "entries", "entry_tags", "entries_fts"] {
            let (exists,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            )
            .bind(table)
            .fetch_one(&mut conn)
            .await
            .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }
}

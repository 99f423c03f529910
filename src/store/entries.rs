//! Entry writes and lookups
//!
//! Writes keep `entries_fts` in step with `entries` inside the same
//! transaction. They must run on the pool's writer connection.

use sqlx::{Connection, SqliteConnection};

use super::helpers::{
    EntryRow, EntrySummary, NewEntry, StoreError, StoreStats, UsageOutcome, ENTRY_COLUMNS,
};

/// Insert a new entry and index it for full-text search. Returns the new id.
pub async fn insert_entry(conn: &mut SqliteConnection, entry: &NewEntry) -> Result<String, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let tags = entry.normalized_tags();
    let now = chrono::Utc::now().to_rfc3339();
    tracing::debug!(id = %id, category = %entry.category, tags = tags.len(), "inserting entry");

    let mut tx = conn.begin().await?;

    sqlx::query(
        "INSERT INTO entries (id, title, problem, solution, category, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&id)
    .bind(entry.title.trim())
    .bind(entry.problem.trim())
    .bind(entry.solution.trim())
    .bind(entry.category.trim())
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    for tag in &tags {
        sqlx::query("INSERT OR IGNORE INTO entry_tags (entry_id, tag) VALUES (?1, ?2)")
            .bind(&id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        "INSERT INTO entries_fts (id, title, problem, solution, tags) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&id)
    .bind(entry.title.trim())
    .bind(entry.problem.trim())
    .bind(entry.solution.trim())
    .bind(tags.join(" "))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(id)
}

/// Bump usage counters for an entry.
pub async fn record_usage(
    conn: &mut SqliteConnection,
    id: &str,
    outcome: UsageOutcome,
) -> Result<(), StoreError> {
    let sql = match outcome {
        UsageOutcome::Viewed => {
            "UPDATE entries SET usage_count = usage_count + 1, updated_at = ?2 WHERE id = ?1"
        }
        UsageOutcome::Success => {
            "UPDATE entries SET usage_count = usage_count + 1, success_count = success_count + 1, updated_at = ?2 WHERE id = ?1"
        }
        UsageOutcome::Failure => {
            "UPDATE entries SET usage_count = usage_count + 1, failure_count = failure_count + 1, updated_at = ?2 WHERE id = ?1"
        }
    };
    let result = sqlx::query(sql)
        .bind(id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Set or clear the archived flag. Archived entries are hidden from search
/// unless the caller asks for them.
pub async fn archive_entry(
    conn: &mut SqliteConnection,
    id: &str,
    archived: bool,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE entries SET archived = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(archived as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Fetch a single entry by id
pub async fn get_entry(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<EntrySummary>, StoreError> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.id = ?1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    match row {
        Some(row) => Ok(Some(EntrySummary::from(EntryRow::from_row(&row)?))),
        None => Ok(None),
    }
}

/// Entry, category and tag counts
pub async fn store_stats(conn: &mut SqliteConnection) -> Result<StoreStats, StoreError> {
    let (total, archived, categories): (i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(archived), 0), COUNT(DISTINCT category COLLATE NOCASE) FROM entries",
    )
    .fetch_one(&mut *conn)
    .await?;
    let (tags,): (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT tag) FROM entry_tags")
        .fetch_one(&mut *conn)
        .await?;
    Ok(StoreStats {
        total_entries: total as u64,
        archived_entries: archived as u64,
        categories: categories as u64,
        distinct_tags: tags as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionManager, Role};
    use crate::store::{init_schema, SqliteManager};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteConnection) {
        let dir = TempDir::new().unwrap();
        let manager = SqliteManager::new(dir.path().join("kb.db"), true);
        let mut conn = manager.connect(Role::Writer).await.unwrap();
        init_schema(&mut conn).await.unwrap();
        (dir, conn)
    }

    fn sample() -> NewEntry {
        NewEntry::new(
            "S0C7 data exception in COBOL",
            "Program abends with S0C7 when reading packed decimal",
            "Initialize the COMP-3 field before arithmetic",
            "COBOL",
        )
        .with_tags(["abend", "S0C7"])
    }

    #[tokio::test]
    async fn test_insert_and_get_entry() {
        let (_dir, mut conn) = setup().await;
        let id = insert_entry(&mut conn, &sample()).await.unwrap();
        let entry = get_entry(&mut conn, &id).await.unwrap().unwrap();
        assert_eq!(entry.category, "COBOL");
        assert_eq!(entry.tags, vec!["abend", "s0c7"]);
        assert_eq!(entry.usage_count, 0);
        assert_eq!(entry.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_tag_with_comma_stays_one_tag() {
        let (_dir, mut conn) = setup().await;
        let entry = sample().with_tags(["rc,8", "abend", "x\u{1f}y"]);
        let id = insert_entry(&mut conn, &entry).await.unwrap();
        let entry = get_entry(&mut conn, &id).await.unwrap().unwrap();
        assert_eq!(entry.tags, vec!["abend", "rc,8", "xy"]);
    }

    #[tokio::test]
    async fn test_insert_indexes_fts() {
        let (_dir, mut conn) = setup().await;
        let id = insert_entry(&mut conn, &sample()).await.unwrap();
        let (found,): (String,) =
            sqlx::query_as("SELECT id FROM entries_fts WHERE entries_fts MATCH '\"packed\"'")
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(found, id);
    }

    #[tokio::test]
    async fn test_record_usage_updates_success_rate() {
        let (_dir, mut conn) = setup().await;
        let id = insert_entry(&mut conn, &sample()).await.unwrap();
        record_usage(&mut conn, &id, UsageOutcome::Success).await.unwrap();
        record_usage(&mut conn, &id, UsageOutcome::Success).await.unwrap();
        record_usage(&mut conn, &id, UsageOutcome::Failure).await.unwrap();
        record_usage(&mut conn, &id, UsageOutcome::Viewed).await.unwrap();
        let entry = get_entry(&mut conn, &id).await.unwrap().unwrap();
        assert_eq!(entry.usage_count, 4);
        assert!((entry.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_record_usage_unknown_entry() {
        let (_dir, mut conn) = setup().await;
        let err = record_usage(&mut conn, "missing", UsageOutcome::Viewed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_store_stats_counts_archived() {
        let (_dir, mut conn) = setup().await;
        let id = insert_entry(&mut conn, &sample()).await.unwrap();
        insert_entry(&mut conn, &NewEntry::new("t", "p", "s", "JCL"))
            .await
            .unwrap();
        archive_entry(&mut conn, &id, true).await.unwrap();
        let stats = store_stats(&mut conn).await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.archived_entries, 1);
        assert_eq!(stats.categories, 2);
        assert_eq!(stats.distinct_tags, 2);
    }
}

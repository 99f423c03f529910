//! Store helper types and row conversion

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version written to the metadata table
///
/// Increment this when changing `schema.sql`. Opening a store checks this
/// against the stored version.
///
/// History:
/// - v1: entries, entry_tags, entries_fts, metadata
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database corruption detected: {0}")]
    Corruption(String),
    #[error("Store created by a newer kbsearch (schema v{0}). Please upgrade.")]
    SchemaNewerThanSupported(i32),
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Columns selected for every entry-shaped row, aliased as `e`.
///
/// Strategy queries append their score expression as column 10. Tags are
/// joined with [`TAG_SEPARATOR`], which normalization never lets into a tag.
pub(crate) const ENTRY_COLUMNS: &str = "e.id, e.title, e.problem, e.solution, e.category, \
     (SELECT group_concat(t.tag, char(31)) FROM entry_tags t WHERE t.entry_id = e.id) AS tags, \
     e.usage_count, e.success_count, e.failure_count, e.created_at";

pub(crate) const TAG_SEPARATOR: char = '\u{1f}';

/// Raw row from the entries table (crate-internal, used by strategies)
#[derive(Debug, Clone)]
pub(crate) struct EntryRow {
    pub id: String,
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub category: String,
    pub tags: Option<String>,
    pub usage_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: String,
}

impl EntryRow {
    /// Read the first ten columns of a row selected with [`ENTRY_COLUMNS`].
    pub(crate) fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get(0)?,
            title: row.try_get(1)?,
            problem: row.try_get(2)?,
            solution: row.try_get(3)?,
            category: row.try_get(4)?,
            tags: row.try_get(5)?,
            usage_count: row.try_get(6)?,
            success_count: row.try_get(7)?,
            failure_count: row.try_get(8)?,
            created_at: row.try_get(9)?,
        })
    }

    /// success / (success + failure), or 0 with no recorded outcomes.
    pub(crate) fn success_rate(&self) -> f64 {
        success_rate(self.success_count, self.failure_count)
    }
}

pub(crate) fn success_rate(success: i64, failure: i64) -> f64 {
    let total = success.max(0) + failure.max(0);
    if total == 0 {
        0.0
    } else {
        success.max(0) as f64 / total as f64
    }
}

/// Knowledge-base entry as returned from search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    /// Unique identifier
    pub id: String,
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub category: String,
    /// Lower-cased tags, sorted
    pub tags: Vec<String>,
    /// Number of times the entry was used
    pub usage_count: u64,
    /// success / (success + failure), 0.0 when never rated
    pub success_rate: f64,
    /// RFC 3339 creation timestamp
    pub created_at: String,
}

impl From<EntryRow> for EntrySummary {
    fn from(row: EntryRow) -> Self {
        let success_rate = row.success_rate();
        let mut tags: Vec<String> = row
            .tags
            .as_deref()
            .unwrap_or("")
            .split(TAG_SEPARATOR)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        tags.sort();
        EntrySummary {
            id: row.id,
            title: row.title,
            problem: row.problem,
            solution: row.solution,
            category: row.category,
            tags,
            usage_count: row.usage_count.max(0) as u64,
            success_rate,
            created_at: row.created_at,
        }
    }
}

/// Fields for a new knowledge-base entry
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub category: String,
    pub tags: Vec<String>,
}

impl NewEntry {
    pub fn new(
        title: impl Into<String>,
        problem: impl Into<String>,
        solution: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            problem: problem.into(),
            solution: solution.into(),
            category: category.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Tags trimmed, lower-cased, de-duplicated and sorted
    pub fn normalized_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .map(|t| t.replace(char::is_control, "").trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

/// Outcome reported when an entry was applied to a problem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Viewed or copied, no verdict
    Viewed,
    Success,
    Failure,
}

/// Entry counts by archive state
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_entries: u64,
    pub archived_entries: u64,
    pub categories: u64,
    pub distinct_tags: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(tags: Option<&str>, success: i64, failure: i64) -> EntryRow {
        EntryRow {
            id: "e1".into(),
            title: "t".into(),
            problem: "p".into(),
            solution: "s".into(),
            category: "JCL".into(),
            tags: tags.map(str::to_string),
            usage_count: 3,
            success_count: success,
            failure_count: failure,
            created_at: "2024-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn test_success_rate_no_outcomes() {
        assert_eq!(success_rate(0, 0), 0.0);
    }

    #[test]
    fn test_success_rate_mixed() {
        assert!((success_rate(3, 1) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_summary_splits_and_sorts_tags() {
        let summary = EntrySummary::from(row(Some("vsam\u{1f}abend\u{1f}jcl"), 1, 1));
        assert_eq!(summary.tags, vec!["abend", "jcl", "vsam"]);
        assert_eq!(summary.success_rate, 0.5);
    }

    #[test]
    fn test_summary_without_tags() {
        let summary = EntrySummary::from(row(None, 0, 0));
        assert!(summary.tags.is_empty());
        assert_eq!(summary.usage_count, 3);
    }

    #[test]
    fn test_normalized_tags() {
        let entry = NewEntry::new("t", "p", "s", "c").with_tags([" VSAM ", "vsam", "", "Jcl"]);
        assert_eq!(entry.normalized_tags(), vec!["jcl", "vsam"]);

        let entry = NewEntry::new("t", "p", "s", "c").with_tags(["a\u{1f}b", "\u{1f}"]);
        assert_eq!(entry.normalized_tags(), vec!["ab"]);
    }
}

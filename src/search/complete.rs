//! Prefix suggestions
//!
//! Titles come from the FTS index (prefix match on the title column),
//! categories and tags from plain prefix scans. Each source is ranked by
//! the usage of the entries behind it, then merged.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::strategies::like_escape;
use crate::query::normalize;
use crate::store::StoreError;

/// Minimum prefix length (characters, after normalization)
pub const MIN_PREFIX_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Title,
    Category,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    pub kind: SuggestionKind,
    /// Summed usage of the entries behind this suggestion
    pub usage: u64,
}

/// `title:"<prefix>"*`, or `None` when nothing searchable is left
fn title_prefix_expr(prefix: &str) -> Option<String> {
    let words: Vec<String> = prefix
        .split_whitespace()
        .map(|w| w.replace(['*', '?', '"'], ""))
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .collect();
    if words.is_empty() {
        return None;
    }
    Some(format!("title:\"{}\"*", words.join(" ")))
}

/// Suggestions for `prefix`, most used first. Archived entries never
/// contribute. Short prefixes yield nothing.
pub async fn suggest(
    conn: &mut SqliteConnection,
    prefix: &str,
    limit: usize,
) -> Result<Vec<Suggestion>, StoreError> {
    let prefix = normalize(prefix);
    if prefix.chars().count() < MIN_PREFIX_LEN || limit == 0 {
        return Ok(Vec::new());
    }
    let like = format!("{}%", like_escape(&prefix));
    let mut out = Vec::new();

    if let Some(expr) = title_prefix_expr(&prefix) {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT e.title, e.usage_count
             FROM entries_fts
             JOIN entries e ON e.id = entries_fts.id
             WHERE entries_fts MATCH ?1 AND e.archived = 0
             ORDER BY e.usage_count DESC, e.title
             LIMIT ?2",
        )
        .bind(&expr)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;
        out.extend(rows.into_iter().map(|(text, usage)| Suggestion {
            text,
            kind: SuggestionKind::Title,
            usage: usage.max(0) as u64,
        }));
    }

    let categories: Vec<(String, i64)> = sqlx::query_as(
        "SELECT lower(category) AS c, CAST(SUM(usage_count) AS INTEGER)
         FROM entries
         WHERE archived = 0 AND lower(category) LIKE ?1 ESCAPE '\\'
         GROUP BY c
         ORDER BY 2 DESC, c
         LIMIT ?2",
    )
    .bind(&like)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    out.extend(categories.into_iter().map(|(text, usage)| Suggestion {
        text,
        kind: SuggestionKind::Category,
        usage: usage.max(0) as u64,
    }));

    let tags: Vec<(String, i64)> = sqlx::query_as(
        "SELECT t.tag, CAST(SUM(e.usage_count) AS INTEGER)
         FROM entry_tags t
         JOIN entries e ON e.id = t.entry_id
         WHERE e.archived = 0 AND t.tag LIKE ?1 ESCAPE '\\'
         GROUP BY t.tag
         ORDER BY 2 DESC, t.tag
         LIMIT ?2",
    )
    .bind(&like)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    out.extend(tags.into_iter().map(|(text, usage)| Suggestion {
        text,
        kind: SuggestionKind::Tag,
        usage: usage.max(0) as u64,
    }));

    Ok(rank(out, limit))
}

/// Most used first, then titles before categories before tags, then text
fn rank(mut suggestions: Vec<Suggestion>, limit: usize) -> Vec<Suggestion> {
    suggestions.sort_by(|a, b| {
        b.usage
            .cmp(&a.usage)
            .then(a.kind.cmp(&b.kind))
            .then_with(|| a.text.cmp(&b.text))
    });
    let mut seen = HashSet::new();
    suggestions.retain(|s| seen.insert((s.kind, s.text.clone())));
    suggestions.truncate(limit);
    suggestions
}

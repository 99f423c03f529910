//! The five search executors
//!
//! Each runs one SQL statement on a reader connection and returns rows in
//! its own relevance order (or the caller's `sort_by`), already windowed
//! by `limit`/`offset`. Archived entries are skipped unless requested.
//!
//! Every statement has the shape `SELECT * FROM (<inner>) ORDER BY ...` so
//! ordering can use plain column names regardless of joins.

use std::time::Duration;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::Instrument;

use super::{CategoryTier, MatchDetail, SearchError, Strategy, StrategyRow};
use crate::pool::{ConnectionPool, Role};
use crate::query::{Query, SearchOptions, SortBy};
use crate::store::helpers::{EntryRow, ENTRY_COLUMNS};
use crate::store::{EntrySummary, SqliteManager, StoreError};

/// bm25 column weights: id (unindexed), title, problem, solution, tags
const BM25_WEIGHTS: &str = "0.0, 3.0, 2.0, 1.5, 1.0";

const SUCCESS_RATE_EXPR: &str =
    "CAST(success_count AS REAL) / MAX(1, success_count + failure_count)";

/// Run a single executor. `Hybrid` is not an executor; use
/// [`fusion::run_hybrid`](super::fusion::run_hybrid).
pub async fn execute(
    strategy: Strategy,
    conn: &mut SqliteConnection,
    query: &Query,
    options: &SearchOptions,
    limit: usize,
    offset: usize,
) -> Result<Vec<StrategyRow>, StoreError> {
    let window = Window { limit, offset };
    let rows = match strategy {
        Strategy::Exact => exact(conn, query, options, window).await?,
        Strategy::Fts => fts(conn, query, options, window).await?,
        Strategy::Fuzzy => fuzzy(conn, query, options, window).await?,
        Strategy::Category => category(conn, query, options, window).await?,
        Strategy::Tag => tag(conn, query, options, window).await?,
        Strategy::Hybrid => {
            return Err(StoreError::Unavailable(
                "hybrid runs through fusion, not as a single executor".into(),
            ))
        }
    };
    tracing::debug!(%strategy, rows = rows.len(), "Strategy executed");
    Ok(rows)
}

/// Borrow a reader and run one executor on it.
///
/// With a `deadline`, an executor that overruns it fails with
/// `StrategyExecutionFailed` and its connection is discarded.
pub async fn run_pooled(
    pool: &ConnectionPool<SqliteManager>,
    strategy: Strategy,
    query: &Query,
    options: &SearchOptions,
    limit: usize,
    offset: usize,
    deadline: Option<Duration>,
) -> Result<Vec<StrategyRow>, SearchError> {
    async move {
        let mut conn = pool
            .acquire(Role::Reader)
            .await
            .map_err(|e| SearchError::in_strategy_pool(strategy, e))?;
        let outcome = match deadline {
            None => Some(execute(strategy, &mut conn, query, options, limit, offset).await),
            Some(d) => {
                tokio::time::timeout(d, execute(strategy, &mut conn, query, options, limit, offset))
                    .await
                    .ok()
            }
        };
        let Some(result) = outcome else {
            conn.discard();
            let deadline_ms = deadline.map_or(0, |d| d.as_millis() as u64);
            tracing::warn!(%strategy, deadline_ms, "Strategy deadline exceeded");
            return Err(SearchError::StrategyExecutionFailed {
                strategy,
                message: format!("exceeded {deadline_ms}ms deadline"),
            });
        };
        result.map_err(|e| {
            tracing::warn!(%strategy, error = %e, "Strategy failed");
            SearchError::in_strategy(strategy, e)
        })
    }
    .instrument(tracing::info_span!("strategy", %strategy, limit, offset))
    .await
}

#[derive(Debug, Clone, Copy)]
struct Window {
    limit: usize,
    offset: usize,
}

/// Substring match on title, problem or solution. Base score 100.
async fn exact(
    conn: &mut SqliteConnection,
    query: &Query,
    options: &SearchOptions,
    window: Window,
) -> Result<Vec<StrategyRow>, StoreError> {
    if query.text.is_empty() {
        return Ok(Vec::new());
    }
    let relevance = format!("usage_count DESC, {SUCCESS_RATE_EXPR} DESC, id");
    let sql = format!(
        "SELECT * FROM (
            SELECT {ENTRY_COLUMNS}, CAST(100 AS REAL) AS score
            FROM entries e
            WHERE (e.title LIKE ?1 ESCAPE '\\' OR e.problem LIKE ?1 ESCAPE '\\' OR e.solution LIKE ?1 ESCAPE '\\'){archived}
        ) ORDER BY {order} LIMIT ?2 OFFSET ?3",
        archived = archived_filter(options),
        order = order_by(options.sort_by, &relevance),
    );
    let rows = sqlx::query(&sql)
        .bind(contains_pattern(&query.text))
        .bind(window.limit as i64)
        .bind(window.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| to_row(row, Strategy::Exact, |_| MatchDetail::Exact))
        .collect()
}

/// FTS5 match ranked by weighted bm25. Multi-token queries are phrases,
/// a single token is a prefix query.
async fn fts(
    conn: &mut SqliteConnection,
    query: &Query,
    options: &SearchOptions,
    window: Window,
) -> Result<Vec<StrategyRow>, StoreError> {
    let Some(expr) = fts_match_expr(&query.tokens) else {
        return Ok(Vec::new());
    };
    let sql = format!(
        "SELECT * FROM (
            SELECT {ENTRY_COLUMNS}, -bm25(entries_fts, {BM25_WEIGHTS}) * 10.0 AS score
            FROM entries_fts
            JOIN entries e ON e.id = entries_fts.id
            WHERE entries_fts MATCH ?1{archived}
        ) ORDER BY {order} LIMIT ?2 OFFSET ?3",
        archived = archived_filter(options),
        order = order_by(options.sort_by, "score DESC, id"),
    );
    let rows = sqlx::query(&sql)
        .bind(&expr)
        .bind(window.limit as i64)
        .bind(window.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            to_row(row, Strategy::Fts, |base| MatchDetail::FullText { bm25: -base / 10.0 })
        })
        .collect()
}

/// Every significant token must hit some field. A token hits when the
/// field contains its leading `fuzzy_threshold` share of characters, so
/// lower thresholds tolerate more of a misspelled tail. Score is the
/// weighted field-hit count (title 3, problem 2, solution 1 per token).
async fn fuzzy(
    conn: &mut SqliteConnection,
    query: &Query,
    options: &SearchOptions,
    window: Window,
) -> Result<Vec<StrategyRow>, StoreError> {
    let terms = fuzzy_terms(&query.tokens);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut required = Vec::with_capacity(terms.len());
    let mut weights = Vec::with_capacity(terms.len());
    for i in 1..=terms.len() {
        required.push(format!(
            "(e.title LIKE ?{i} ESCAPE '\\' OR e.problem LIKE ?{i} ESCAPE '\\' OR e.solution LIKE ?{i} ESCAPE '\\')"
        ));
        weights.push(format!(
            "(CASE WHEN e.title LIKE ?{i} ESCAPE '\\' THEN 3 ELSE 0 END \
             + CASE WHEN e.problem LIKE ?{i} ESCAPE '\\' THEN 2 ELSE 0 END \
             + CASE WHEN e.solution LIKE ?{i} ESCAPE '\\' THEN 1 ELSE 0 END)"
        ));
    }
    let n = terms.len();
    let sql = format!(
        "SELECT * FROM (
            SELECT {ENTRY_COLUMNS}, CAST({weights} AS REAL) AS score
            FROM entries e
            WHERE {required}{archived}
        ) WHERE score > 0
        ORDER BY {order} LIMIT ?{limit} OFFSET ?{offset}",
        weights = weights.join(" + "),
        required = required.join(" AND "),
        archived = archived_filter(options),
        order = order_by(options.sort_by, "score DESC, usage_count DESC, id"),
        limit = n + 1,
        offset = n + 2,
    );

    let mut q = sqlx::query(&sql);
    for term in &terms {
        q = q.bind(wildcard_pattern(similar_prefix(term, options.fuzzy_threshold)));
    }
    let rows = q
        .bind(window.limit as i64)
        .bind(window.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            to_row(row, Strategy::Fuzzy, |base| MatchDetail::Fuzzy {
                field_hits: base.max(0.0) as u32,
            })
        })
        .collect()
}

/// Entries in one category, tiered by which field the optional secondary
/// text matched.
async fn category(
    conn: &mut SqliteConnection,
    query: &Query,
    options: &SearchOptions,
    window: Window,
) -> Result<Vec<StrategyRow>, StoreError> {
    let Some(category) = options.effective_category(query) else {
        return Ok(Vec::new());
    };
    let filtered = !query.text.is_empty();
    let text_filter = if filtered {
        " AND (e.title LIKE ?2 ESCAPE '\\' OR e.problem LIKE ?2 ESCAPE '\\' OR e.solution LIKE ?2 ESCAPE '\\')"
    } else {
        ""
    };
    let sql = format!(
        "SELECT * FROM (
            SELECT {ENTRY_COLUMNS},
                CAST(CASE
                    WHEN ?2 = '' THEN {any}
                    WHEN e.title LIKE ?2 ESCAPE '\\' THEN {title}
                    WHEN e.problem LIKE ?2 ESCAPE '\\' THEN {problem}
                    WHEN e.solution LIKE ?2 ESCAPE '\\' THEN {solution}
                    ELSE {any}
                END AS REAL) AS score
            FROM entries e
            WHERE e.category = ?1 COLLATE NOCASE{text_filter}{archived}
        ) ORDER BY {order} LIMIT ?3 OFFSET ?4",
        any = CategoryTier::Any.base_score(),
        title = CategoryTier::Title.base_score(),
        problem = CategoryTier::Problem.base_score(),
        solution = CategoryTier::Solution.base_score(),
        archived = archived_filter(options),
        order = order_by(options.sort_by, "score DESC, usage_count DESC, id"),
    );
    let pattern = if filtered {
        contains_pattern(&query.text)
    } else {
        String::new()
    };
    let rows = sqlx::query(&sql)
        .bind(&category)
        .bind(pattern)
        .bind(window.limit as i64)
        .bind(window.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            to_row(row, Strategy::Category, |base| MatchDetail::Category {
                tier: CategoryTier::from_base(base),
            })
        })
        .collect()
}

/// Entries carrying any of the requested tags, scored by how many match.
async fn tag(
    conn: &mut SqliteConnection,
    query: &Query,
    options: &SearchOptions,
    window: Window,
) -> Result<Vec<StrategyRow>, StoreError> {
    let tags = options.effective_tags(query);
    if tags.is_empty() {
        return Ok(Vec::new());
    }
    let n = tags.len();
    let placeholders: Vec<String> = (1..=n).map(|i| format!("?{i}")).collect();
    let text_filter = if query.text.is_empty() {
        String::new()
    } else {
        let p = n + 1;
        format!(
            " AND (e.title LIKE ?{p} ESCAPE '\\' OR e.problem LIKE ?{p} ESCAPE '\\' OR e.solution LIKE ?{p} ESCAPE '\\')"
        )
    };
    let sql = format!(
        "SELECT * FROM (
            SELECT {ENTRY_COLUMNS}, CAST(COUNT(DISTINCT m.tag) AS REAL) AS score
            FROM entries e
            JOIN entry_tags m ON m.entry_id = e.id
            WHERE m.tag COLLATE NOCASE IN ({placeholders}){text_filter}{archived}
            GROUP BY e.id
        ) ORDER BY {order} LIMIT ?{limit} OFFSET ?{offset}",
        placeholders = placeholders.join(", "),
        archived = archived_filter(options),
        order = order_by(options.sort_by, "score DESC, usage_count DESC, id"),
        limit = n + 2,
        offset = n + 3,
    );

    let mut q = sqlx::query(&sql);
    for t in &tags {
        q = q.bind(t);
    }
    // Keep numbering stable whether or not the text filter is present
    let pattern = contains_pattern(&query.text);
    let rows = q
        .bind(pattern)
        .bind(window.limit as i64)
        .bind(window.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            to_row(row, Strategy::Tag, |base| MatchDetail::Tag {
                matched: base.max(0.0) as u32,
            })
        })
        .collect()
}

fn to_row(
    row: &SqliteRow,
    strategy: Strategy,
    detail: impl Fn(f64) -> MatchDetail,
) -> Result<StrategyRow, StoreError> {
    let entry = EntryRow::from_row(row)?;
    let base: f64 = row.try_get(10)?;
    let base = if base.is_finite() { base.max(0.0) } else { 0.0 };
    Ok(StrategyRow {
        entry: EntrySummary::from(entry),
        base_score: base,
        strategy,
        detail: detail(base),
    })
}

fn archived_filter(options: &SearchOptions) -> &'static str {
    if options.include_archived {
        ""
    } else {
        " AND e.archived = 0"
    }
}

/// Outer ORDER BY; `relevance` is the strategy's own ordering
fn order_by(sort: SortBy, relevance: &str) -> String {
    match sort {
        SortBy::Relevance => relevance.to_string(),
        SortBy::Usage => "usage_count DESC, id".to_string(),
        SortBy::SuccessRate => format!("{SUCCESS_RATE_EXPR} DESC, usage_count DESC, id"),
        SortBy::CreatedAt => "created_at DESC, id".to_string(),
    }
}

/// Tokens longer than two characters, or every token when none is
fn fuzzy_terms(tokens: &[String]) -> Vec<&str> {
    let long: Vec<&str> = tokens
        .iter()
        .map(String::as_str)
        .filter(|t| t.chars().count() > 2)
        .collect();
    if long.is_empty() {
        tokens.iter().map(String::as_str).collect()
    } else {
        long
    }
}

/// Leading `threshold` share of `term`, at least one character
fn similar_prefix(term: &str, threshold: f64) -> &str {
    let len = term.chars().count();
    if len == 0 {
        return term;
    }
    let keep = ((threshold * len as f64) - 1e-9).ceil().clamp(1.0, len as f64) as usize;
    match term.char_indices().nth(keep) {
        Some((at, _)) => &term[..at],
        None => term,
    }
}

pub(crate) fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn contains_pattern(text: &str) -> String {
    format!("%{}%", like_escape(text))
}

/// `*` and `?` become SQL `%` and `_`; everything else is literal
fn wildcard_pattern(term: &str) -> String {
    let escaped = like_escape(term).replace('*', "%").replace('?', "_");
    format!("%{escaped}%")
}

/// FTS5 MATCH expression, `None` when nothing searchable is left
pub(crate) fn fts_match_expr(tokens: &[String]) -> Option<String> {
    let cleaned: Vec<String> = tokens
        .iter()
        .map(|t| t.replace(['*', '?', '"'], ""))
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .collect();
    match cleaned.as_slice() {
        [] => None,
        [single] => Some(format!("\"{single}\"*")),
        many => Some(format!("\"{}\"", many.join(" "))),
    }
}

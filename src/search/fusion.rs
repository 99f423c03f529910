//! Hybrid search: fan out to fts, fuzzy and exact, then merge
//!
//! Each sub-strategy runs as its own task with its own reader and at most
//! [`HYBRID_SUB_LIMIT`] rows. A failed sub-strategy is logged and left out;
//! the request only fails when all of them fail.
//!
//! Fused ranking key per entry: `max(base scores) * ln(strategies + 1)`.
//! A single-strategy match is therefore weighted by ln 2 (~0.69), below its
//! raw base score.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use super::strategies::run_pooled;
use super::{SearchError, Strategy, StrategyRow};
use crate::pool::ConnectionPool;
use crate::query::{Query, SearchOptions};
use crate::store::{EntrySummary, SqliteManager};

/// Rows requested from each sub-strategy
pub const HYBRID_SUB_LIMIT: usize = 5;

/// Sub-strategies run by hybrid search
pub const HYBRID_STRATEGIES: [Strategy; 3] = [Strategy::Fts, Strategy::Fuzzy, Strategy::Exact];

/// One entry after fusion
#[derive(Debug, Clone, PartialEq)]
pub struct FusedRow {
    pub entry: EntrySummary,
    /// Highest base score any strategy gave this entry
    pub max_base: f64,
    /// Contributing strategies, sorted
    pub strategies: Vec<Strategy>,
    /// `max_base * ln(strategies.len() + 1)`
    pub fused_score: f64,
}

impl FusedRow {
    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }
}

/// Merge per-strategy outputs. Ordered by fused score, descending, ties by
/// entry id so the order is reproducible.
pub fn fuse<I>(outputs: I) -> Vec<FusedRow>
where
    I: IntoIterator<Item = Vec<StrategyRow>>,
{
    let mut by_id: HashMap<String, FusedRow> = HashMap::new();
    for rows in outputs {
        for row in rows {
            let StrategyRow {
                entry,
                base_score,
                strategy,
                ..
            } = row;
            match by_id.get_mut(&entry.id) {
                Some(fused) => {
                    if base_score > fused.max_base {
                        fused.max_base = base_score;
                        fused.entry = entry;
                    }
                    if !fused.strategies.contains(&strategy) {
                        fused.strategies.push(strategy);
                    }
                }
                None => {
                    by_id.insert(
                        entry.id.clone(),
                        FusedRow {
                            entry,
                            max_base: base_score,
                            strategies: vec![strategy],
                            fused_score: 0.0,
                        },
                    );
                }
            }
        }
    }

    let mut fused: Vec<FusedRow> = by_id
        .into_values()
        .map(|mut f| {
            f.strategies.sort();
            f.fused_score = f.max_base * (f.strategies.len() as f64 + 1.0).ln();
            f
        })
        .collect();
    fused.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    fused
}

/// Run the hybrid fan-out and fuse the successful outputs.
///
/// Returns the full fused list; the caller applies offset and limit.
pub async fn run_hybrid(
    pool: &ConnectionPool<SqliteManager>,
    query: Arc<Query>,
    options: Arc<SearchOptions>,
    deadline: Option<Duration>,
) -> Result<Vec<FusedRow>, SearchError> {
    let mut tasks = JoinSet::new();
    for strategy in HYBRID_STRATEGIES {
        let pool = pool.clone();
        let query = Arc::clone(&query);
        let options = Arc::clone(&options);
        tasks.spawn(async move {
            let result = run_pooled(
                &pool,
                strategy,
                &query,
                &options,
                HYBRID_SUB_LIMIT,
                0,
                deadline,
            )
            .await;
            (strategy, result)
        });
    }

    let mut outputs: Vec<(Strategy, Vec<StrategyRow>)> = Vec::with_capacity(HYBRID_STRATEGIES.len());
    let mut failures: Vec<SearchError> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((strategy, Ok(rows))) => outputs.push((strategy, rows)),
            Ok((strategy, Err(e))) => {
                tracing::warn!(%strategy, error = %e, "Hybrid sub-strategy failed, continuing without it");
                failures.push(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Hybrid sub-strategy task panicked");
                failures.push(SearchError::StrategyExecutionFailed {
                    strategy: Strategy::Hybrid,
                    message: e.to_string(),
                });
            }
        }
    }

    if outputs.is_empty() {
        return Err(all_failed(failures));
    }
    outputs.sort_by_key(|(strategy, _)| *strategy);
    tracing::debug!(
        succeeded = outputs.len(),
        failed = failures.len(),
        "Hybrid fan-out complete"
    );
    Ok(fuse(outputs.into_iter().map(|(_, rows)| rows)))
}

/// Every sub-strategy failed. Pure pool exhaustion stays retryable.
fn all_failed(failures: Vec<SearchError>) -> SearchError {
    let exhausted = failures
        .iter()
        .find(|e| matches!(e, SearchError::PoolExhausted { .. }))
        .cloned();
    let all_exhausted = failures
        .iter()
        .all(|e| matches!(e, SearchError::PoolExhausted { .. }));
    match exhausted {
        Some(e) if all_exhausted => e,
        _ => SearchError::AllStrategiesFailed(failures.iter().map(ToString::to_string).collect()),
    }
}

//! Query routing, strategy execution, fusion and scoring
//!
//! - `router` - Picks a strategy from query shape (pure)
//! - `strategies` - The five SQL executors
//! - `fusion` - Hybrid fan-out and merge
//! - `complete` - Prefix suggestions for autocomplete
//! - `scoring` - Final 0-100 relevance score

pub mod complete;
pub mod fusion;
pub mod router;
pub mod scoring;
pub mod strategies;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::{PoolError, Role};
use crate::store::{EntrySummary, StoreError};

pub use complete::{Suggestion, SuggestionKind};
pub use fusion::{fuse, FusedRow, HYBRID_SUB_LIMIT};
pub use router::select;
pub use scoring::score;

/// Search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Exact,
    Fts,
    Fuzzy,
    Category,
    Tag,
    /// Fan-out over fts, fuzzy and exact
    Hybrid,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::Exact,
        Strategy::Fts,
        Strategy::Fuzzy,
        Strategy::Category,
        Strategy::Tag,
        Strategy::Hybrid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Exact => "exact",
            Strategy::Fts => "fts",
            Strategy::Fuzzy => "fuzzy",
            Strategy::Category => "category",
            Strategy::Tag => "tag",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SearchError::InvalidQueryOptions(format!("unknown strategy '{}'", s)))
    }
}

/// Which field a category row matched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryTier {
    Title,
    Problem,
    Solution,
    /// No secondary filter, or it matched nothing
    Any,
}

impl CategoryTier {
    pub fn base_score(self) -> f64 {
        match self {
            CategoryTier::Title => 90.0,
            CategoryTier::Problem => 80.0,
            CategoryTier::Solution => 70.0,
            CategoryTier::Any => 60.0,
        }
    }

    pub(crate) fn from_base(base: f64) -> Self {
        if base >= 90.0 {
            CategoryTier::Title
        } else if base >= 80.0 {
            CategoryTier::Problem
        } else if base >= 70.0 {
            CategoryTier::Solution
        } else {
            CategoryTier::Any
        }
    }
}

/// Strategy-specific evidence behind a row's base score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchDetail {
    Exact,
    FullText { bm25: f64 },
    /// Weighted field hits: title x3, problem x2, solution x1 per token
    Fuzzy { field_hits: u32 },
    Category { tier: CategoryTier },
    Tag { matched: u32 },
    /// Fused from several strategies
    Hybrid { strategies: Vec<Strategy> },
}

/// One executor output row
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyRow {
    pub entry: EntrySummary,
    pub base_score: f64,
    pub strategy: Strategy,
    pub detail: MatchDetail,
}

impl StrategyRow {
    pub fn id(&self) -> &str {
        &self.entry.id
    }
}

/// A scored search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub entry: EntrySummary,
    /// Relevance in [0, 100]
    pub score: f64,
    pub strategy: Strategy,
    /// Strategies that found this entry (1 outside hybrid)
    pub strategy_count: usize,
    pub detail: MatchDetail,
}

/// Search errors.
///
/// `Clone` so one failed load can be handed to every single-flight waiter.
#[derive(Error, Debug, Clone)]
pub enum SearchError {
    #[error("Invalid query options: {0}")]
    InvalidQueryOptions(String),
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
    #[error("Search temporarily unavailable: no {role} connection within {waited_ms}ms")]
    PoolExhausted { role: Role, waited_ms: u64 },
    #[error("Strategy {strategy} failed: {message}")]
    StrategyExecutionFailed { strategy: Strategy, message: String },
    #[error("All strategies failed: {}", .0.join("; "))]
    AllStrategiesFailed(Vec<String>),
    #[error("Cache backend unavailable: {0}")]
    CacheBackendUnavailable(String),
    #[error("Storage error: {0}")]
    Storage(Arc<StoreError>),
}

impl SearchError {
    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::PoolExhausted { .. })
    }

    /// Map a pool failure outside of any strategy
    pub(crate) fn from_pool(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted { role, waited_ms } => SearchError::PoolExhausted { role, waited_ms },
            PoolError::Connect { source, .. } => SearchError::Storage(Arc::new(source)),
            other => SearchError::Storage(Arc::new(StoreError::Unavailable(other.to_string()))),
        }
    }

    /// Map a pool failure while running `strategy`. Exhaustion keeps its
    /// own kind so callers can retry.
    pub(crate) fn in_strategy_pool(strategy: Strategy, e: PoolError) -> Self {
        match e {
            PoolError::Exhausted { role, waited_ms } => SearchError::PoolExhausted { role, waited_ms },
            other => SearchError::StrategyExecutionFailed {
                strategy,
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn in_strategy(strategy: Strategy, e: StoreError) -> Self {
        SearchError::StrategyExecutionFailed {
            strategy,
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for SearchError {
    fn from(e: StoreError) -> Self {
        SearchError::Storage(Arc::new(e))
    }
}

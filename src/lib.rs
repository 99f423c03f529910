//! # kbsearch - Embedded knowledge-base search
//!
//! Search over a single SQLite file of problem/solution entries. Each query
//! is routed to one of five strategies (exact, full-text, fuzzy, category,
//! tag) or to a hybrid fan-out that fuses several of them, then scored by
//! relevance, popularity and past success.
//!
//! ## Features
//!
//! - **Routing**: error codes, `category:`/`tag:` operators and free text
//!   each get the strategy that fits
//! - **Result cache**: TTL, tags, priority eviction, single-flight loads
//!   and an optional durable tier
//! - **Connection pool**: one writer, bounded readers, acquire timeout
//!
//! ## Quick Start
//!
//! ```no_run
//! use kbsearch::{EngineConfig, NewEntry, SearchEngine, SearchOptions};
//!
//! # async fn example() -> Result<(), kbsearch::SearchError> {
//! let engine = SearchEngine::open("kb.db".as_ref(), EngineConfig::default()).await?;
//! engine
//!     .add_entry(
//!         NewEntry::new("S0C7 data exception", "Abend on packed field", "Initialize it", "COBOL")
//!             .with_tags(["abend"]),
//!     )
//!     .await?;
//!
//! let response = engine.search("S0C7", SearchOptions::default()).await?;
//! for hit in &response.results {
//!     println!("{:.1} {}", hit.score, hit.entry.title);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod health;
pub mod pool;
pub mod query;
pub mod search;
pub mod store;
pub mod telemetry;

pub use cache::{CacheConfig, CacheLookup, CacheStats, ResultCache};
pub use engine::{CachedValue, EngineCache, EngineConfig, SearchConfig, SearchEngine, SearchResponse};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, Role};
pub use query::{Query, SearchOptions, SortBy};
pub use search::{SearchError, SearchResult, Strategy, Suggestion, SuggestionKind};
pub use store::{EntrySummary, NewEntry, StoreStats, UsageOutcome};
pub use telemetry::{OperationMetric, TelemetrySink, TracingSink};

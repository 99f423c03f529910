//! Search engine
//!
//! One handle over the connection pool, the result cache and the search
//! pipeline. Every public operation is timed, logged when slow and reported
//! to the telemetry sink.
//!
//! Search flow: validate options, build the cache key, then either serve a
//! fresh cached result or run the load once (router, executor or hybrid
//! fan-out, scoring) and cache it under tags that writes can invalidate.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::cache::{
    CacheBackend, CacheConfig, CacheLookup, CacheOptions, CacheStats, EntryInfo, Priority,
    ResultCache, SqliteCacheBackend,
};
use crate::health::{self, HealthReport};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection, Role};
use crate::query::{normalize, CacheKey, Complexity, Query, SearchOptions, SortBy, MAX_LIMIT};
use crate::search::complete::{suggest, MIN_PREFIX_LEN};
use crate::search::fusion::run_hybrid;
use crate::search::strategies::run_pooled;
use crate::search::{
    score, select, FusedRow, MatchDetail, SearchError, SearchResult, Strategy, Suggestion,
};
use crate::store::{self, EntrySummary, NewEntry, SqliteManager, StoreStats, UsageOutcome};
use crate::telemetry::{self, OperationMetric, TelemetrySink, TracingSink};

/// Autocomplete results live briefly
pub const AUTOCOMPLETE_TTL: Duration = Duration::from_secs(60);

/// Cache tag carried by every unfiltered text search
pub const FULLTEXT_TAG: &str = "fulltext";
pub const SEARCH_TAG: &str = "search";
pub const AUTOCOMPLETE_TAG: &str = "autocomplete";

/// Timing thresholds for search execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Per-executor deadline; unset means executors run to completion
    pub strategy_timeout_ms: Option<u64>,
    /// Operations slower than this are logged at warn
    pub slow_warn_ms: u64,
    /// Operations slower than this are logged at error
    pub slow_critical_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_ms: None,
            slow_warn_ms: 500,
            slow_critical_ms: 1000,
        }
    }
}

impl SearchConfig {
    pub fn strategy_timeout(&self) -> Option<Duration> {
        self.strategy_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
}

/// Ranked results for one search call
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    /// Normalized query text
    pub query: String,
    /// `None` when nothing was run (empty query without filters)
    pub strategy: Option<Strategy>,
    pub results: Vec<SearchResult>,
    pub lookup: Option<CacheLookup>,
    pub elapsed_ms: u64,
}

impl SearchResponse {
    fn empty(query: String) -> Self {
        Self {
            query,
            strategy: None,
            results: Vec::new(),
            lookup: None,
            elapsed_ms: 0,
        }
    }

    /// Served without running this caller's own load
    pub fn from_cache(&self) -> bool {
        self.lookup.is_some_and(CacheLookup::is_cached)
    }
}

/// What the engine caches. Search results and suggestions share one cache
/// under `search|` and `complete|` keys, so one size and memory budget
/// covers both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum CachedValue {
    Results(Vec<SearchResult>),
    Suggestions(Vec<Suggestion>),
}

impl CachedValue {
    fn kind(&self) -> &'static str {
        match self {
            CachedValue::Results(_) => "results",
            CachedValue::Suggestions(_) => "suggestions",
        }
    }
}

pub type EngineCache = ResultCache<CachedValue, SearchError>;

fn wrong_kind(key: &CacheKey, found: &CachedValue) -> SearchError {
    SearchError::CacheBackendUnavailable(format!(
        "cache entry {} holds {}",
        key.as_str(),
        found.kind()
    ))
}

struct EngineInner {
    pool: ConnectionPool<SqliteManager>,
    cache: EngineCache,
    durable: Option<Arc<SqliteCacheBackend>>,
    telemetry: Arc<dyn TelemetrySink>,
    config: EngineConfig,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Knowledge-base search engine. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct SearchEngine {
    inner: Arc<EngineInner>,
}

impl SearchEngine {
    /// Assemble an engine from parts. The store behind `pool` must already
    /// have its schema.
    pub fn new(
        pool: ConnectionPool<SqliteManager>,
        cache: EngineCache,
        telemetry: Arc<dyn TelemetrySink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                pool,
                cache,
                durable: None,
                telemetry,
                config,
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Open (creating if needed) the store at `path` with the default
    /// tracing telemetry sink.
    pub async fn open(path: &Path, config: EngineConfig) -> Result<Self, SearchError> {
        Self::open_with_telemetry(path, config, Arc::new(TracingSink)).await
    }

    pub async fn open_with_telemetry(
        path: &Path,
        config: EngineConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, SearchError> {
        let manager = SqliteManager::new(path, config.pool.enable_wal);
        let pool = ConnectionPool::new(manager, config.pool.clone()).map_err(SearchError::from_pool)?;

        // Readers open read-only, so the writer creates the file first
        {
            let mut writer = pool
                .acquire(Role::Writer)
                .await
                .map_err(SearchError::from_pool)?;
            store::init_schema(&mut writer).await?;
        }

        let durable = if config.cache.persist_to_disk {
            let cache_path = config
                .cache
                .disk_path
                .clone()
                .unwrap_or_else(|| default_cache_path(path));
            match SqliteCacheBackend::open(&cache_path, config.cache.compression_enabled).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    tracing::warn!(
                        path = %cache_path.display(),
                        error = %SearchError::CacheBackendUnavailable(e.to_string()),
                        "Durable cache tier unavailable, caching in memory only"
                    );
                    None
                }
            }
        } else {
            None
        };

        let backend = durable
            .clone()
            .map(|b| -> Arc<dyn CacheBackend> { b });
        let cache = ResultCache::with_backend(&config.cache, backend);
        let reaper = pool.spawn_reaper();

        tracing::info!(
            path = %path.display(),
            wal = config.pool.enable_wal,
            max_readers = config.pool.max_readers,
            persistent_cache = durable.is_some(),
            "Search engine opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                pool,
                cache,
                durable,
                telemetry,
                config,
                reaper: Mutex::new(Some(reaper)),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Ranked search.
    ///
    /// Fails on invalid options, on a single strategy failing, when every
    /// hybrid sub-strategy failed, or (retryably) when no reader was free
    /// within the acquire timeout.
    pub async fn search(
        &self,
        raw: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();
        let query = Query::parse(raw);
        let complexity = query.complexity();
        let result = self
            .search_inner(query, options)
            .instrument(tracing::info_span!("search", query = %raw))
            .await;
        let records = result.as_ref().map_or(0, |r| r.results.len());
        if let Err(e) = &result {
            tracing::warn!(error = %e, retryable = e.is_retryable(), "Search failed");
        }
        let elapsed_ms = self.inner.finish("search", started, records, Some(complexity));
        result.map(|mut response| {
            response.elapsed_ms = elapsed_ms;
            response
        })
    }

    async fn search_inner(
        &self,
        query: Query,
        options: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        options.validate()?;
        let category = options.effective_category(&query);
        let tags = options.effective_tags(&query);
        if query.is_empty() && category.is_none() && tags.is_empty() {
            return Ok(SearchResponse::empty(query.normalized));
        }

        let strategy = select(&query, &options);
        let key = CacheKey::search(&query, &options);
        let cache_options = self.inner.cache_options(strategy, category.as_deref(), &tags);
        let normalized = query.normalized.clone();

        let inner = Arc::clone(&self.inner);
        let query = Arc::new(query);
        let options = Arc::new(options);
        let (cached, lookup) = self
            .inner
            .cache
            .get_or_load(key.as_str(), cache_options, move || async move {
                inner
                    .run_search(strategy, query, options)
                    .await
                    .map(CachedValue::Results)
            })
            .await?;
        let CachedValue::Results(results) = cached.as_ref() else {
            return Err(wrong_kind(&key, &cached));
        };

        tracing::debug!(%strategy, ?lookup, results = results.len(), "Search complete");
        Ok(SearchResponse {
            query: normalized,
            strategy: Some(strategy),
            results: results.clone(),
            lookup: Some(lookup),
            elapsed_ms: 0,
        })
    }

    /// Suggestions for a typed prefix. Prefixes shorter than two characters
    /// return nothing.
    pub async fn auto_complete(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<Suggestion>, SearchError> {
        let started = Instant::now();
        let result = self
            .auto_complete_inner(prefix, limit)
            .instrument(tracing::info_span!("auto_complete", prefix))
            .await;
        self.inner
            .finish("auto_complete", started, result.as_ref().map_or(0, Vec::len), None);
        result
    }

    async fn auto_complete_inner(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<Suggestion>, SearchError> {
        if limit == 0 || limit > MAX_LIMIT {
            return Err(SearchError::InvalidQueryOptions(format!(
                "limit must be between 1 and {MAX_LIMIT}, got {limit}"
            )));
        }
        if normalize(prefix).chars().count() < MIN_PREFIX_LEN {
            return Ok(Vec::new());
        }

        let key = CacheKey::autocomplete(prefix, limit);
        let options = CacheOptions::new(AUTOCOMPLETE_TTL)
            .with_tags([AUTOCOMPLETE_TAG])
            .with_priority(Priority::Low);
        let pool = self.inner.pool.clone();
        let prefix = prefix.to_string();
        let (cached, _) = self
            .inner
            .cache
            .get_or_load(key.as_str(), options, move || async move {
                let mut conn = pool
                    .acquire(Role::Reader)
                    .await
                    .map_err(SearchError::from_pool)?;
                let found = suggest(&mut conn, &prefix, limit).await?;
                Ok::<_, SearchError>(CachedValue::Suggestions(found))
            })
            .await?;
        match cached.as_ref() {
            CachedValue::Suggestions(suggestions) => Ok(suggestions.clone()),
            other => Err(wrong_kind(&key, other)),
        }
    }

    /// Remove cached results whose key matches `pattern` (a regular
    /// expression) or that carry any of `tags`. With neither, everything
    /// is removed. Returns the number of keys removed.
    pub async fn invalidate_cache(
        &self,
        pattern: Option<&str>,
        tags: &[String],
    ) -> Result<usize, SearchError> {
        let started = Instant::now();
        let regex = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| SearchError::InvalidQueryOptions(format!("invalid cache pattern: {e}")))?;
        let removed = self.inner.cache.invalidate(regex.as_ref(), tags).await;
        tracing::info!(removed, ?pattern, ?tags, "Cache invalidated");
        self.inner.finish("invalidate_cache", started, removed, None);
        Ok(removed)
    }

    /// Counters for the shared search and autocomplete cache
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// The engine's connection pool, for diagnostics and maintenance
    pub fn pool(&self) -> &ConnectionPool<SqliteManager> {
        &self.inner.pool
    }

    /// TTL, tags and priority of a cached search result
    pub fn cache_entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.inner.cache.entry_info(key.as_str())
    }

    /// Pool responsiveness, store integrity and cache state in one report.
    /// Never fails; problems show up as warnings.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let report = health::check(&self.inner.pool, self.cache_stats())
            .instrument(tracing::info_span!("health_check"))
            .await;
        self.inner.finish("health_check", started, 0, None);
        report
    }

    /// Create an entry. Invalidates cached full-text results and any
    /// results filtered on the entry's category or tags.
    pub async fn add_entry(&self, entry: NewEntry) -> Result<String, SearchError> {
        let started = Instant::now();
        for (field, value) in [("title", &entry.title), ("category", &entry.category)] {
            if value.trim().is_empty() {
                return Err(SearchError::InvalidEntry(format!("{field} must not be blank")));
            }
        }
        let id = {
            let mut conn = self.writer().await?;
            store::insert_entry(&mut conn, &entry).await?
        };
        let removed = self
            .inner
            .invalidate_for_entry(&entry.category, &entry.normalized_tags())
            .await;
        tracing::info!(id = %id, category = %entry.category, invalidated = removed, "Entry added");
        self.inner.finish("add_entry", started, 1, None);
        Ok(id)
    }

    /// Record how an entry worked out. Only ranking signals change, so
    /// cached results are left to expire.
    pub async fn record_feedback(
        &self,
        id: &str,
        outcome: UsageOutcome,
    ) -> Result<(), SearchError> {
        let started = Instant::now();
        {
            let mut conn = self.writer().await?;
            store::record_usage(&mut conn, id, outcome).await?;
        }
        tracing::debug!(id, ?outcome, "Feedback recorded");
        self.inner.finish("record_feedback", started, 1, None);
        Ok(())
    }

    /// Archive or restore an entry, invalidating like [`add_entry`](Self::add_entry)
    pub async fn archive_entry(&self, id: &str, archived: bool) -> Result<(), SearchError> {
        let started = Instant::now();
        let entry = {
            let mut conn = self.writer().await?;
            let entry = store::get_entry(&mut conn, id)
                .await?
                .ok_or_else(|| store::StoreError::NotFound(id.to_string()))?;
            store::archive_entry(&mut conn, id, archived).await?;
            entry
        };
        let removed = self
            .inner
            .invalidate_for_entry(&entry.category, &entry.tags)
            .await;
        tracing::info!(id, archived, invalidated = removed, "Entry archive state changed");
        self.inner.finish("archive_entry", started, 1, None);
        Ok(())
    }

    pub async fn get_entry(&self, id: &str) -> Result<Option<EntrySummary>, SearchError> {
        let mut conn = self.reader().await?;
        Ok(store::get_entry(&mut conn, id).await?)
    }

    pub async fn store_stats(&self) -> Result<StoreStats, SearchError> {
        let mut conn = self.reader().await?;
        Ok(store::store_stats(&mut conn).await?)
    }

    /// Stop the reaper and close idle connections. Later calls fail with a
    /// storage error.
    pub async fn close(&self) {
        let reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reaper {
            handle.abort();
        }
        self.inner.pool.close().await;
        if let Some(durable) = &self.inner.durable {
            durable.close().await;
        }
    }

    async fn reader(&self) -> Result<PooledConnection<SqliteManager>, SearchError> {
        self.inner
            .pool
            .acquire(Role::Reader)
            .await
            .map_err(SearchError::from_pool)
    }

    async fn writer(&self) -> Result<PooledConnection<SqliteManager>, SearchError> {
        self.inner
            .pool
            .acquire(Role::Writer)
            .await
            .map_err(SearchError::from_pool)
    }
}

impl EngineInner {
    /// TTL, priority and tags for a search result. Filtered searches live
    /// twice as long and are evicted last.
    fn cache_options(
        &self,
        strategy: Strategy,
        category: Option<&str>,
        tags: &[String],
    ) -> CacheOptions {
        let filtered = category.is_some() || !tags.is_empty();
        let mut cache_tags = vec![SEARCH_TAG.to_string(), format!("strategy:{strategy}")];
        if let Some(c) = category {
            cache_tags.push(format!("category:{c}"));
        }
        cache_tags.extend(tags.iter().map(|t| format!("tag:{t}")));
        if !matches!(strategy, Strategy::Category | Strategy::Tag) {
            cache_tags.push(FULLTEXT_TAG.to_string());
        }

        let ttl = self.config.cache.default_ttl();
        let (ttl, priority) = if filtered {
            (ttl.saturating_mul(2), Priority::High)
        } else {
            (ttl, Priority::Normal)
        };
        CacheOptions::new(ttl)
            .with_tags(cache_tags)
            .with_priority(priority)
    }

    async fn run_search(
        &self,
        strategy: Strategy,
        query: Arc<Query>,
        options: Arc<SearchOptions>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let deadline = self.config.search.strategy_timeout();
        if strategy == Strategy::Hybrid {
            let mut fused = run_hybrid(&self.pool, query, Arc::clone(&options), deadline).await?;
            order_fused(&mut fused, options.sort_by);
            return Ok(fused
                .into_iter()
                .skip(options.offset)
                .take(options.limit)
                .map(hybrid_result)
                .collect());
        }

        let rows = run_pooled(
            &self.pool,
            strategy,
            &query,
            &options,
            options.limit,
            options.offset,
            deadline,
        )
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| SearchResult {
                score: score(
                    row.base_score,
                    row.entry.usage_count,
                    row.entry.success_rate,
                    row.strategy,
                ),
                strategy: row.strategy,
                strategy_count: 1,
                detail: row.detail,
                entry: row.entry,
            })
            .collect())
    }

    async fn invalidate_for_entry(&self, category: &str, tags: &[String]) -> usize {
        let mut cache_tags = vec![
            FULLTEXT_TAG.to_string(),
            format!("category:{}", category.trim().to_lowercase()),
        ];
        cache_tags.extend(tags.iter().map(|t| format!("tag:{t}")));
        cache_tags.push(AUTOCOMPLETE_TAG.to_string());
        self.cache.invalidate(None, &cache_tags).await
    }

    /// Slow-operation logging and telemetry. Returns elapsed milliseconds.
    fn finish(
        &self,
        operation: &'static str,
        started: Instant,
        records: usize,
        complexity: Option<Complexity>,
    ) -> u64 {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let limits = &self.config.search;
        if elapsed_ms > limits.slow_critical_ms {
            tracing::error!(
                operation,
                elapsed_ms,
                threshold_ms = limits.slow_critical_ms,
                "Critical slow operation"
            );
        } else if elapsed_ms > limits.slow_warn_ms {
            tracing::warn!(
                operation,
                elapsed_ms,
                threshold_ms = limits.slow_warn_ms,
                "Slow operation"
            );
        }
        telemetry::emit(
            self.telemetry.as_ref(),
            OperationMetric {
                operation,
                duration_ms: elapsed_ms,
                records_processed: records,
                query_complexity: complexity,
            },
        );
        elapsed_ms
    }
}

/// Hybrid rows are scored with the fused ranking key as base
fn hybrid_result(row: FusedRow) -> SearchResult {
    SearchResult {
        score: score(
            row.fused_score,
            row.entry.usage_count,
            row.entry.success_rate,
            Strategy::Hybrid,
        ),
        strategy: Strategy::Hybrid,
        strategy_count: row.strategy_count(),
        detail: MatchDetail::Hybrid {
            strategies: row.strategies,
        },
        entry: row.entry,
    }
}

/// Re-order fused rows for a non-relevance sort. Stable, so fused order
/// breaks ties.
fn order_fused(rows: &mut [FusedRow], sort_by: SortBy) {
    match sort_by {
        SortBy::Relevance => {}
        SortBy::Usage => rows.sort_by(|a, b| b.entry.usage_count.cmp(&a.entry.usage_count)),
        SortBy::SuccessRate => {
            rows.sort_by(|a, b| b.entry.success_rate.total_cmp(&a.entry.success_rate))
        }
        SortBy::CreatedAt => rows.sort_by(|a, b| b.entry.created_at.cmp(&a.entry.created_at)),
    }
}

/// `<store>.cache.db` next to the store file
fn default_cache_path(store: &Path) -> PathBuf {
    let mut name = store
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "kbsearch".into());
    name.push(".cache.db");
    store.with_file_name(name)
}

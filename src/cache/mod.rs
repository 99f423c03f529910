//! Result cache with TTL, tags, priority eviction and single-flight loads
//!
//! - Fresh entries (`age < ttl`) are served from memory; expired entries are
//!   never returned and are swept before any capacity eviction.
//! - Concurrent misses on one key share a single loader run. The loader's
//!   error is handed to every waiter and nothing is cached.
//! - Over `max_size` entries or `max_memory_mb` bytes, the lowest priority
//!   entries go first, least recently used among equals.
//! - An optional [`CacheBackend`] persists entries across restarts. Backend
//!   failures are logged and counted, never returned. Write-through and
//!   invalidation are serialized, and a write-through is skipped once its
//!   memory entry has been removed or replaced.

mod backend;

pub use backend::{CacheBackend, CacheError, SqliteCacheBackend, StoredEntry};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Eviction priority. Lower priorities are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub(crate) fn level(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub(crate) fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

/// Per-entry settings passed to [`ResultCache::get_or_load`] and
/// [`ResultCache::set`]
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub priority: Priority,
}

impl CacheOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tags: Vec::new(),
            priority: Priority::Normal,
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

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_ms: u64,
    pub max_memory_mb: u64,
    pub persist_to_disk: bool,
    pub compression_enabled: bool,
    /// Durable tier file; defaults next to the store
    pub disk_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_ms: 300_000,
            max_memory_mb: 50,
            persist_to_disk: false,
            compression_enabled: false,
            disk_path: None,
        }
    }
}

impl CacheConfig {
    pub fn max_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLookup {
    /// Fresh in memory
    Hit,
    /// Promoted from the durable tier
    Disk,
    /// Computed by this caller's loader
    Loaded,
    /// Shared another caller's in-flight load
    Joined,
}

impl CacheLookup {
    /// True unless this caller ran the loader itself
    pub fn is_cached(self) -> bool {
        !matches!(self, CacheLookup::Loaded)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub joined: u64,
    pub disk_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_memory_bytes: usize,
    pub inflight: usize,
    pub backend_errors: u64,
    pub persistent: bool,
    pub hit_rate: f64,
}

/// Diagnostic view of one entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub ttl_ms: u64,
    pub age_ms: u64,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub size_bytes: usize,
    pub hits: u64,
}

struct Entry<V> {
    value: Arc<V>,
    /// Flight or `set` call that stored this value
    origin: u64,
    created_at: Instant,
    ttl: Duration,
    tags: Vec<String>,
    priority: Priority,
    size: usize,
    hits: u64,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

type LoadFuture<V, E> = Shared<BoxFuture<'static, Result<(Arc<V>, CacheLookup), E>>>;

struct Flight<V, E> {
    id: u64,
    tags: Vec<String>,
    future: LoadFuture<V, E>,
}

struct State<V, E> {
    entries: LruCache<String, Entry<V>>,
    inflight: HashMap<String, Flight<V, E>>,
    bytes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    joined: AtomicU64,
    disk_hits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    backend_errors: AtomicU64,
}

struct Inner<V, E> {
    state: Mutex<State<V, E>>,
    max_size: usize,
    max_bytes: usize,
    backend: Option<Arc<dyn CacheBackend>>,
    counters: Counters,
    next_flight: AtomicU64,
    durable: tokio::sync::Mutex<()>,
}

/// In-memory result cache, optionally backed by a durable tier.
///
/// Cheap to clone; clones share state.
pub struct ResultCache<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for ResultCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> ResultCache<V, E>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Memory-only cache
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_backend(config, None)
    }

    pub fn with_backend(config: &CacheConfig, backend: Option<Arc<dyn CacheBackend>>) -> Self {
        tracing::debug!(
            max_size = config.max_size,
            max_memory_mb = config.max_memory_mb,
            persistent = backend.is_some(),
            "Result cache created"
        );
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: LruCache::unbounded(),
                    inflight: HashMap::new(),
                    bytes: 0,
                }),
                max_size: config.max_size.max(1),
                max_bytes: config.max_bytes().max(1),
                backend,
                counters: Counters::default(),
                next_flight: AtomicU64::new(1),
                durable: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Return the fresh value for `key`, or run `loader` to compute it.
    ///
    /// Concurrent calls for the same key while a load is in flight all await
    /// that one load. The loader is only called when the durable tier has
    /// no fresh copy either.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        options: CacheOptions,
        loader: F,
    ) -> Result<(Arc<V>, CacheLookup), E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (future, joined) = {
            let mut state = self.inner.lock();
            let now = Instant::now();
            if let Some(value) = self.inner.fresh_hit(&mut state, key, now) {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key, "Cache hit");
                return Ok((value, CacheLookup::Hit));
            }

            if let Some(flight) = state.inflight.get(key) {
                self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                (flight.future.clone(), true)
            } else {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let future = Inner::flight(
                    Arc::clone(&self.inner),
                    key.to_string(),
                    id,
                    options.clone(),
                    loader,
                )
                .boxed()
                .shared();
                state.inflight.insert(
                    key.to_string(),
                    Flight {
                        id,
                        tags: options.tags,
                        future: future.clone(),
                    },
                );
                (future, false)
            }
        };

        let (value, lookup) = future.await?;
        Ok((value, if joined { CacheLookup::Joined } else { lookup }))
    }

    /// Memory-only lookup. Does not consult the durable tier.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut state = self.inner.lock();
        let value = self.inner.fresh_hit(&mut state, key, Instant::now());
        if value.is_some() {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Store a value directly, replacing any existing entry and superseding
    /// an in-flight load for the same key.
    pub async fn set(&self, key: &str, value: V, options: CacheOptions) {
        let value = Arc::new(value);
        let encoded = serde_json::to_vec(&*value).ok();
        let origin = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.lock();
            state.inflight.remove(key);
            let payload = encoded.as_ref().map_or(std::mem::size_of::<V>(), Vec::len);
            let size = entry_size(key, payload, &options.tags);
            self.inner
                .insert(&mut state, key, Arc::clone(&value), origin, &options, size, Instant::now());
        }
        if let Some(bytes) = encoded {
            self.inner.write_through(key, origin, bytes, &options).await;
        }
    }

    /// Remove entries whose key matches `pattern` or that carry any of
    /// `tags`; with neither, remove everything. In-flight loads for removed
    /// keys are not stored when they finish.
    ///
    /// Returns the number of distinct keys removed across both tiers.
    pub async fn invalidate(&self, pattern: Option<&Regex>, tags: &[String]) -> usize {
        let everything = pattern.is_none() && tags.is_empty();
        let selected = |key: &str, entry_tags: &[String]| {
            everything
                || pattern.is_some_and(|p| p.is_match(key))
                || entry_tags.iter().any(|t| tags.contains(t))
        };

        let _durable = self.inner.durable.lock().await;
        let mut removed: HashSet<String> = {
            let mut state = self.inner.lock();
            let doomed: Vec<String> = state
                .entries
                .iter()
                .filter(|(k, e)| selected(k.as_str(), e.tags.as_slice()))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &doomed {
                if let Some(entry) = state.entries.pop(key) {
                    state.bytes = state.bytes.saturating_sub(entry.size);
                }
            }
            state.inflight.retain(|k, f| !selected(k.as_str(), f.tags.as_slice()));
            doomed.into_iter().collect()
        };

        if let Some(backend) = &self.inner.backend {
            match backend.invalidate(pattern, tags).await {
                Ok(keys) => removed.extend(keys),
                Err(e) => self.inner.backend_failed("invalidate", &e),
            }
        }

        tracing::debug!(
            removed = removed.len(),
            pattern = pattern.map(|p| p.as_str()),
            ?tags,
            "Cache invalidated"
        );
        removed.len()
    }

    /// Drop every entry in both tiers
    pub async fn clear(&self) {
        let _durable = self.inner.durable.lock().await;
        {
            let mut state = self.inner.lock();
            state.entries.clear();
            state.inflight.clear();
            state.bytes = 0;
        }
        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.clear().await {
                self.inner.backend_failed("clear", &e);
            }
        }
        tracing::debug!("Cache cleared");
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let state = self.inner.lock();
        let now = Instant::now();
        let entry = state.entries.peek(key).filter(|e| e.is_fresh(now))?;
        Some(EntryInfo {
            ttl_ms: entry.ttl.as_millis() as u64,
            age_ms: now.saturating_duration_since(entry.created_at).as_millis() as u64,
            tags: entry.tags.clone(),
            priority: entry.priority,
            size_bytes: entry.size,
            hits: entry.hits,
        })
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, memory_bytes, inflight) = {
            let state = self.inner.lock();
            (state.entries.len(), state.bytes, state.inflight.len())
        };
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let joined = c.joined.load(Ordering::Relaxed);
        let lookups = hits + misses + joined;
        CacheStats {
            hits,
            misses,
            loads: c.loads.load(Ordering::Relaxed),
            joined,
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            entries,
            memory_bytes,
            max_memory_bytes: self.inner.max_bytes,
            inflight,
            backend_errors: c.backend_errors.load(Ordering::Relaxed),
            persistent: self.inner.backend.is_some(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

impl<V, E> Inner<V, E>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, bumping LRU position and hit count. Drops the
    /// entry if it has expired.
    fn fresh_hit(&self, state: &mut State<V, E>, key: &str, now: Instant) -> Option<Arc<V>> {
        match state.entries.get_mut(key) {
            Some(entry) if entry.is_fresh(now) => {
                entry.hits += 1;
                return Some(Arc::clone(&entry.value));
            }
            Some(_) => {}
            None => return None,
        }
        if let Some(entry) = state.entries.pop(key) {
            state.bytes = state.bytes.saturating_sub(entry.size);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// The shared body of one load: durable tier first, then the loader.
    async fn flight<F, Fut>(
        self: Arc<Self>,
        key: String,
        id: u64,
        options: CacheOptions,
        loader: F,
    ) -> Result<(Arc<V>, CacheLookup), E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some((value, stored)) = self.read_through(&key).await {
            let value = Arc::new(value);
            let created_at = Instant::now()
                .checked_sub(stored.age)
                .unwrap_or_else(Instant::now);
            let stored_options = CacheOptions {
                ttl: stored.ttl,
                tags: stored.tags,
                priority: stored.priority,
            };
            self.finish(&key, id, Some((&value, &stored_options, Some(stored.size), created_at)));
            self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "Cache entry promoted from durable tier");
            return Ok((value, CacheLookup::Disk));
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        match loader().await {
            Ok(value) => {
                let value = Arc::new(value);
                let encoded = serde_json::to_vec(&*value).ok();
                let size = encoded.as_ref().map(|b| entry_size(&key, b.len(), &options.tags));
                let stored = self.finish(&key, id, Some((&value, &options, size, Instant::now())));
                tracing::debug!(
                    key = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    stored,
                    "Cache load complete"
                );
                if let (true, Some(bytes)) = (stored, encoded) {
                    self.write_through(&key, id, bytes, &options).await;
                }
                Ok((value, CacheLookup::Loaded))
            }
            Err(e) => {
                self.finish(&key, id, None);
                tracing::debug!(key = %key, "Cache load failed, not cached");
                Err(e)
            }
        }
    }

    /// Unregister flight `id` and store its value. Returns false when the
    /// flight was superseded by `set`, `invalidate` or `clear`.
    fn finish(
        &self,
        key: &str,
        id: u64,
        loaded: Option<(&Arc<V>, &CacheOptions, Option<usize>, Instant)>,
    ) -> bool {
        let mut state = self.lock();
        let current = state.inflight.get(key).is_some_and(|f| f.id == id);
        if !current {
            return false;
        }
        state.inflight.remove(key);
        let Some((value, options, size, created_at)) = loaded else {
            return false;
        };
        let size = size.unwrap_or_else(|| entry_size(key, std::mem::size_of::<V>(), &options.tags));
        self.insert(&mut state, key, Arc::clone(value), id, options, size, created_at);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        state: &mut State<V, E>,
        key: &str,
        value: Arc<V>,
        origin: u64,
        options: &CacheOptions,
        size: usize,
        created_at: Instant,
    ) {
        let entry = Entry {
            value,
            origin,
            created_at,
            ttl: options.ttl,
            tags: options.tags.clone(),
            priority: options.priority,
            size,
            hits: 0,
        };
        if let Some(old) = state.entries.put(key.to_string(), entry) {
            state.bytes = state.bytes.saturating_sub(old.size);
        }
        state.bytes += size;
        self.enforce_limits(state);
    }

    /// Sweep expired entries, then evict by priority and recency until under
    /// both ceilings.
    fn enforce_limits(&self, state: &mut State<V, E>) {
        if state.entries.len() <= self.max_size && state.bytes <= self.max_bytes {
            return;
        }

        let now = Instant::now();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.is_fresh(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = state.entries.pop(&key) {
                state.bytes = state.bytes.saturating_sub(entry.size);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        while state.entries.len() > self.max_size || state.bytes > self.max_bytes {
            let Some(lowest) = state.entries.iter().map(|(_, e)| e.priority).min() else {
                break;
            };
            // iter() runs most to least recent
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, e)| e.priority == lowest)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = state.entries.pop(&victim) {
                state.bytes = state.bytes.saturating_sub(entry.size);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %victim, priority = ?entry.priority, "Cache entry evicted");
            }
        }
    }

    async fn read_through(&self, key: &str) -> Option<(V, Promoted)> {
        let backend = self.backend.as_ref()?;
        let stored = match backend.get(key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                self.backend_failed("read", &e);
                return None;
            }
        };
        let age = stored.remaining_age(backend::now_ms())?;
        match serde_json::from_slice::<V>(&stored.value) {
            Ok(value) => Some((
                value,
                Promoted {
                    age,
                    ttl: Duration::from_millis(stored.ttl_ms),
                    size: entry_size(key, stored.value.len(), &stored.tags),
                    tags: stored.tags,
                    priority: stored.priority,
                },
            )),
            Err(e) => {
                self.backend_failed("decode", &CacheError::from(e));
                None
            }
        }
    }

    /// Persist the value stored by `origin`. Holds the durable lock so an
    /// invalidation cannot interleave; skipped when the memory entry no
    /// longer comes from `origin`.
    async fn write_through(&self, key: &str, origin: u64, value: Vec<u8>, options: &CacheOptions) {
        let Some(backend) = &self.backend else { return };
        let _durable = self.durable.lock().await;
        let current = self.lock().entries.peek(key).is_some_and(|e| e.origin == origin);
        if !current {
            tracing::trace!(key, "Write-through skipped, entry superseded");
            return;
        }
        let stored = StoredEntry {
            value,
            created_at_ms: backend::now_ms(),
            ttl_ms: options.ttl.as_millis() as u64,
            tags: options.tags.clone(),
            priority: options.priority,
        };
        if let Err(e) = backend.put(key, stored).await {
            self.backend_failed("write", &e);
        }
    }

    fn backend_failed(&self, op: &str, error: &CacheError) {
        self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op, error = %error, "Cache backend unavailable, continuing memory-only");
    }
}

/// Durable entry being promoted into memory
struct Promoted {
    age: Duration,
    ttl: Duration,
    size: usize,
    tags: Vec<String>,
    priority: Priority,
}

/// Approximate footprint: payload plus key and tag strings
fn entry_size(key: &str, payload: usize, tags: &[String]) -> usize {
    payload + key.len() + tags.iter().map(String::len).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    type TestCache = ResultCache<String, String>;

    fn cache(max_size: usize, max_memory_mb: u64) -> TestCache {
        ResultCache::new(&CacheConfig {
            max_size,
            max_memory_mb,
            ..CacheConfig::default()
        })
    }

    fn opts(ttl_ms: u64) -> CacheOptions {
        CacheOptions::new(Duration::from_millis(ttl_ms))
    }

    async fn load(cache: &TestCache, key: &str, value: &str, calls: &Arc<AtomicUsize>) -> CacheLookup {
        let calls = Arc::clone(calls);
        let value = value.to_string();
        let (_, lookup) = cache
            .get_or_load(key, opts(60_000), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
            .await
            .unwrap();
        lookup
    }

    #[tokio::test]
    async fn test_loader_runs_once_within_ttl() {
        let cache = cache(10, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(load(&cache, "k", "v", &calls).await, CacheLookup::Loaded);
        assert_eq!(load(&cache, "k", "v", &calls).await, CacheLookup::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_loads() {
        let cache = cache(10, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_load("shared", opts(60_000), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>("computed".to_string())
                    })
                    .await
                    .map(|(v, _)| v)
            }));
        }
        let mut values = Vec::new();
        for t in tasks {
            values.push(t.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(cache.stats().joined, 15);
    }

    #[tokio::test]
    async fn test_loader_error_shared_and_not_cached() {
        let cache = cache(10, 1);
        let first = cache.get_or_load("bad", opts(60_000), || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<String, _>("boom".to_string())
        });
        let second = cache.get_or_load("bad", opts(60_000), || async {
            Ok::<_, String>("unreachable".to_string())
        });
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap_err(), "boom");
        assert_eq!(b.unwrap_err(), "boom");
        assert_eq!(cache.stats().entries, 0);

        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(load(&cache, "bad", "ok", &calls).await, CacheLookup::Loaded);
    }

    #[tokio::test]
    async fn test_expired_entry_not_returned() {
        let cache = cache(10, 1);
        cache.set("k", "old".into(), opts(20)).await;
        assert!(cache.get("k").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.entry_info("k").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_eviction_prefers_low_priority_then_lru() {
        let cache = cache(3, 1);
        cache.set("high", "h".into(), opts(60_000).with_priority(Priority::High)).await;
        cache.set("low-old", "a".into(), opts(60_000).with_priority(Priority::Low)).await;
        cache.set("low-new", "b".into(), opts(60_000).with_priority(Priority::Low)).await;
        cache.set("normal", "n".into(), opts(60_000)).await;

        assert!(cache.get("low-old").is_none());
        assert!(cache.get("low-new").is_some());
        assert!(cache.get("high").is_some());
        assert!(cache.get("normal").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_recent_use_protects_from_eviction() {
        let cache = cache(2, 1);
        cache.set("a", "1".into(), opts(60_000)).await;
        cache.set("b", "2".into(), opts(60_000)).await;
        assert!(cache.get("a").is_some());
        cache.set("c", "3".into(), opts(60_000)).await;
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[tokio::test]
    async fn test_memory_ceiling_enforced() {
        let cache = cache(1_000, 1);
        let big = "x".repeat(300 * 1024);
        for i in 0..6 {
            cache.set(&format!("k{i}"), big.clone(), opts(60_000)).await;
        }
        let stats = cache.stats();
        assert!(stats.memory_bytes <= 1024 * 1024);
        assert_eq!(stats.entries, 3);
        assert!(cache.get("k5").is_some());
        assert!(cache.get("k0").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_or_tag() {
        let cache = cache(10, 1);
        cache.set("search|jcl", "1".into(), opts(60_000).with_tags(["category:jcl"])).await;
        cache.set("search|cobol", "2".into(), opts(60_000).with_tags(["category:cobol"])).await;
        cache.set("complete|co", "3".into(), opts(60_000).with_tags(["autocomplete"])).await;

        let pattern = Regex::new("^complete").unwrap();
        let removed = cache
            .invalidate(Some(&pattern), &["category:jcl".to_string()])
            .await;
        assert_eq!(removed, 2);
        assert!(cache.get("search|cobol").is_some());
        assert_eq!(cache.invalidate(None, &[]).await, 1);
        assert_eq!(cache.stats().memory_bytes, 0);
    }

    #[tokio::test]
    async fn test_invalidate_during_load_skips_store() {
        let cache = cache(10, 1);
        let loading = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load("k", opts(60_000).with_tags(["search"]), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>("stale".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate(None, &["search".to_string()]).await;
        let (value, _) = loading.await.unwrap().unwrap();
        assert_eq!(*value, "stale");
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn test_entry_info_reports_options() {
        let cache = cache(10, 1);
        cache
            .set("k", "v".into(), opts(600_000).with_tags(["a", "b"]).with_priority(Priority::High))
            .await;
        let info = cache.entry_info("k").unwrap();
        assert_eq!(info.ttl_ms, 600_000);
        assert_eq!(info.tags, vec!["a", "b"]);
        assert_eq!(info.priority, Priority::High);
        assert!(info.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_durable_tier_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let config = CacheConfig::default();
        {
            let backend = SqliteCacheBackend::open(&path, true).await.unwrap();
            let cache: TestCache = ResultCache::with_backend(&config, Some(Arc::new(backend)));
            let calls = Arc::new(AtomicUsize::new(0));
            load(&cache, "persisted", "value", &calls).await;
        }
        let backend = SqliteCacheBackend::open(&path, true).await.unwrap();
        let cache: TestCache = ResultCache::with_backend(&config, Some(Arc::new(backend)));
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(load(&cache, "persisted", "other", &calls).await, CacheLookup::Disk);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*cache.get("persisted").unwrap(), "value");
    }

    struct BrokenBackend;

    impl CacheBackend for BrokenBackend {
        fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, CacheError>> {
            async { Err(CacheError::Io(std::io::Error::other("disk gone"))) }.boxed()
        }

        fn put<'a>(&'a self, _key: &'a str, _entry: StoredEntry) -> BoxFuture<'a, Result<(), CacheError>> {
            async { Err(CacheError::Io(std::io::Error::other("disk gone"))) }.boxed()
        }

        fn invalidate<'a>(
            &'a self,
            _pattern: Option<&'a Regex>,
            _tags: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
            async { Err(CacheError::Io(std::io::Error::other("disk gone"))) }.boxed()
        }

        fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>> {
            async { Err(CacheError::Io(std::io::Error::other("disk gone"))) }.boxed()
        }
    }

    /// Durable tier whose writes stall before reaching SQLite
    struct StallingBackend {
        inner: SqliteCacheBackend,
        put_delay: Duration,
    }

    impl CacheBackend for StallingBackend {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, CacheError>> {
            self.inner.get(key)
        }

        fn put<'a>(&'a self, key: &'a str, entry: StoredEntry) -> BoxFuture<'a, Result<(), CacheError>> {
            async move {
                tokio::time::sleep(self.put_delay).await;
                self.inner.put(key, entry).await
            }
            .boxed()
        }

        fn invalidate<'a>(
            &'a self,
            pattern: Option<&'a Regex>,
            tags: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
            self.inner.invalidate(pattern, tags)
        }

        fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>> {
            self.inner.clear()
        }
    }

    async fn stalling(path: &std::path::Path, put_ms: u64) -> TestCache {
        let backend = StallingBackend {
            inner: SqliteCacheBackend::open(path, false).await.unwrap(),
            put_delay: Duration::from_millis(put_ms),
        };
        ResultCache::with_backend(&CacheConfig::default(), Some(Arc::new(backend)))
    }

    async fn reload_after_restart(path: &std::path::Path, key: &str) -> (String, CacheLookup) {
        let backend = SqliteCacheBackend::open(path, false).await.unwrap();
        let cache: TestCache = ResultCache::with_backend(&CacheConfig::default(), Some(Arc::new(backend)));
        let (value, lookup) = cache
            .get_or_load(key, opts(60_000), || async { Ok::<_, String>("fresh".to_string()) })
            .await
            .unwrap();
        ((*value).clone(), lookup)
    }

    #[tokio::test]
    async fn test_invalidate_waits_for_pending_write_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = stalling(&path, 150).await;
            let loading = {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_load("k", opts(60_000).with_tags(["search"]), || async {
                            Ok::<_, String>("stale".to_string())
                        })
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(30)).await;
            cache.invalidate(None, &["search".to_string()]).await;
            loading.await.unwrap().unwrap();
            assert!(cache.get("k").is_none());
        }
        assert_eq!(
            reload_after_restart(&path, "k").await,
            ("fresh".to_string(), CacheLookup::Loaded)
        );
    }

    #[tokio::test]
    async fn test_write_through_skipped_after_invalidation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = stalling(&path, 150).await;
            // Holds the durable tier while the rest queues up behind it
            let blocker = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.set("other", "x".into(), opts(60_000)).await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            let loading = {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_load("k", opts(60_000).with_tags(["search"]), || async {
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            Ok::<_, String>("stale".to_string())
                        })
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            let invalidating = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.invalidate(None, &["search".to_string()]).await })
            };
            blocker.await.unwrap();
            invalidating.await.unwrap();
            loading.await.unwrap().unwrap();
            assert!(cache.get("k").is_none());
        }
        assert_eq!(
            reload_after_restart(&path, "k").await,
            ("fresh".to_string(), CacheLookup::Loaded)
        );
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_memory() {
        let cache: TestCache =
            ResultCache::with_backend(&CacheConfig::default(), Some(Arc::new(BrokenBackend)));
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(load(&cache, "k", "v", &calls).await, CacheLookup::Loaded);
        assert_eq!(load(&cache, "k", "v", &calls).await, CacheLookup::Hit);
        assert_eq!(cache.invalidate(None, &[]).await, 1);
        // read + write during the load, then invalidate
        assert_eq!(cache.stats().backend_errors, 3);
    }

    #[test]
    fn test_priority_levels_round_trip() {
        for p in [Priority::Low, Priority::Normal, Priority::High] {
            assert_eq!(Priority::from_level(p.level()), p);
        }
        assert!(Priority::Low < Priority::Normal && Priority::Normal < Priority::High);
    }
}

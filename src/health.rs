//! Health check: pool responsiveness, store integrity and cache state
//!
//! Composes the pool probe, `PRAGMA quick_check`, store counts and cache
//! counters into a single report. Only a failed probe or a failed
//! integrity check makes the report unhealthy; everything else degrades to
//! a warning.

use std::time::Duration;

use serde::Serialize;

use crate::cache::CacheStats;
use crate::pool::{ConnectionPool, PoolHealth, PoolStats, Role};
use crate::store::{self, SqliteManager, StoreStats};

/// Store probe timeout, capped by the pool's acquire timeout
const STORE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lookups needed before a low hit rate is worth a warning
const HIT_RATE_MIN_LOOKUPS: u64 = 100;
const LOW_HIT_RATE: f64 = 0.1;

/// Fraction of the memory ceiling that triggers a warning
const MEMORY_PRESSURE: f64 = 0.9;

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub integrity_ok: bool,
    pub schema_version: Option<i32>,
    pub stats: Option<StoreStats>,
}

/// Engine health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub pool: PoolHealth,
    pub pool_stats: PoolStats,
    pub store: StoreHealth,
    pub cache: CacheStats,
    /// Non-fatal findings from degraded sub-checks
    pub warnings: Vec<String>,
}

/// Run every check. Never fails.
pub(crate) async fn check(pool: &ConnectionPool<SqliteManager>, cache: CacheStats) -> HealthReport {
    let pool_health = pool.health_check().await;
    let mut warnings = Vec::new();
    if let Some(msg) = &pool_health.message {
        warnings.push(format!("Pool probe failed: {msg}"));
    }

    let store = probe_store(pool, &mut warnings).await;

    let pool_stats = pool.stats();
    if pool_health.blocked_waiters > 0 {
        warnings.push(format!(
            "{} acquirers blocked waiting for a connection",
            pool_health.blocked_waiters
        ));
    }
    if pool_health.timeouts > 0 {
        warnings.push(format!("{} connection acquires timed out", pool_health.timeouts));
    }
    if pool_health.connect_errors > 0 {
        warnings.push(format!("{} connection attempts failed", pool_health.connect_errors));
    }

    warnings.extend(cache_warnings(&cache));

    let healthy = pool_health.healthy && store.integrity_ok;
    if !healthy {
        tracing::warn!(warnings = warnings.len(), "Health check failed");
    } else {
        tracing::debug!(warnings = warnings.len(), "Health check passed");
    }

    HealthReport {
        healthy,
        pool: pool_health,
        pool_stats,
        store,
        cache,
        warnings,
    }
}

async fn probe_store(pool: &ConnectionPool<SqliteManager>, warnings: &mut Vec<String>) -> StoreHealth {
    let timeout = pool.config().acquire_timeout().min(STORE_PROBE_TIMEOUT);
    let mut conn = match pool.acquire_within(Role::Reader, timeout).await {
        Ok(c) => c,
        Err(e) => {
            warnings.push(format!("Store probe skipped: {e}"));
            return StoreHealth {
                integrity_ok: false,
                schema_version: None,
                stats: None,
            };
        }
    };

    let integrity_ok = match store::quick_check(&mut conn).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Store integrity check failed");
            warnings.push(format!("Integrity check failed: {e}"));
            false
        }
    };

    let schema_version = match store::stored_schema_version(&mut conn).await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read schema version");
            warnings.push(format!("Schema version unreadable: {e}"));
            None
        }
    };

    let stats = match store::store_stats(&mut conn).await {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read store stats");
            warnings.push(format!("Store stats failed: {e}"));
            None
        }
    };

    StoreHealth {
        integrity_ok,
        schema_version,
        stats,
    }
}

fn cache_warnings(cache: &CacheStats) -> Vec<String> {
    let mut warnings = Vec::new();
    if cache.backend_errors > 0 {
        warnings.push(format!(
            "Durable cache tier failed {} times, serving from memory",
            cache.backend_errors
        ));
    }
    if cache.max_memory_bytes > 0
        && cache.memory_bytes as f64 >= cache.max_memory_bytes as f64 * MEMORY_PRESSURE
    {
        warnings.push(format!(
            "Cache memory at {} of {} bytes",
            cache.memory_bytes, cache.max_memory_bytes
        ));
    }
    let lookups = cache.hits + cache.misses;
    if lookups >= HIT_RATE_MIN_LOOKUPS && cache.hit_rate < LOW_HIT_RATE {
        warnings.push(format!(
            "Cache hit rate {:.1}% over {lookups} lookups",
            cache.hit_rate * 100.0
        ));
    }
    warnings
}

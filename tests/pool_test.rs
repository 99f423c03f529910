//! Connection pool limits seen through the engine: reader exhaustion,
//! single writer, concurrency bound and health.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::TestEngine;
use kbsearch::pool::PoolError;
use kbsearch::{EngineConfig, PoolConfig, Role, SearchError, SearchOptions};

fn tight_pool(max_readers: usize, acquire_timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        pool: PoolConfig {
            max_readers,
            acquire_timeout_ms,
            ..PoolConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_exhausted_readers_fail_fast_and_recover() {
    let kb = TestEngine::seeded_with_config(tight_pool(5, 200)).await;

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(kb.pool().acquire(Role::Reader).await.unwrap());
    }

    let err = kb.pool().acquire(Role::Reader).await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Exhausted {
            role: Role::Reader,
            waited_ms
        } if waited_ms >= 200
    ));
    assert_eq!(kb.pool_stats().readers.timeouts, 1);
    assert_eq!(kb.pool_stats().readers.in_use, 5);

    let err = kb
        .search("file not found", SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::PoolExhausted { role: Role::Reader, .. }));
    assert!(err.is_retryable());

    // Writes go through the writer, which is still free
    kb.record_feedback(&kb.ids[0], kbsearch::UsageOutcome::Viewed)
        .await
        .unwrap();

    held.pop();
    let response = kb
        .search("file not found", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 2);
}

#[tokio::test]
async fn test_failed_search_is_not_cached() {
    let kb = TestEngine::seeded_with_config(tight_pool(1, 100)).await;
    let held = kb.pool().acquire(Role::Reader).await.unwrap();
    assert!(kb.search("category:JCL", SearchOptions::default()).await.is_err());
    drop(held);

    let response = kb.search("category:JCL", SearchOptions::default()).await.unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.results.len(), 3);
}

#[tokio::test]
async fn test_concurrent_readers_bounded() {
    let kb = TestEngine::seeded_with_config(tight_pool(3, 5_000)).await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..12 {
        let pool = kb.pool().clone();
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        tasks.spawn(async move {
            let _conn = pool.acquire(Role::Reader).await.unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak {peak}");
    let stats = kb.pool_stats();
    assert!(stats.readers.open <= 3);
    assert_eq!(stats.readers.in_use, 0);
    assert_eq!(stats.readers.timeouts, 0);
}

#[tokio::test]
async fn test_single_writer() {
    let kb = TestEngine::seeded().await;
    let writer = kb.pool().acquire(Role::Writer).await.unwrap();

    let err = kb
        .pool()
        .acquire_within(Role::Writer, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { role: Role::Writer, .. }));

    // Readers keep working while the writer is held
    let response = kb.search("tag:abend", SearchOptions::default()).await.unwrap();
    assert_eq!(response.results.len(), 3);

    drop(writer);
    kb.pool()
        .acquire_within(Role::Writer, Duration::from_millis(100))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalid_pool_config_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = tight_pool(2, 100);
    config.pool.max_writers = 2;
    let err = kbsearch::SearchEngine::open(&dir.path().join("kb.db"), config)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SearchError::Storage(_)), "{err}");
}

#[tokio::test]
async fn test_health_reports_store_and_pool() {
    let kb = TestEngine::seeded().await;
    let report = kb.health_check().await;
    assert!(report.healthy, "{:?}", report.warnings);
    assert!(report.pool.healthy);
    assert!(report.store.integrity_ok);
    assert_eq!(report.store.stats.as_ref().unwrap().total_entries, 5);
    assert!(report.store.schema_version.is_some());

    kb.close().await;
    let report = kb.health_check().await;
    assert!(!report.healthy);
}

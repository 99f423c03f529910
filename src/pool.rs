//! Reader/writer connection pool for the single-writer store
//!
//! SQLite allows one writer at a time; with WAL enabled any number of
//! readers proceed alongside it. The pool encodes that model directly:
//!
//! - one bounded slot set per [`Role`], each guarded by a semaphore
//! - `acquire(role)` reuses an idle connection, opens a new one while the
//!   role is under its maximum, and otherwise waits up to
//!   `acquire_timeout_ms` before failing with [`PoolError::Exhausted`]
//! - handles return to the idle list on drop; idle connections are closed
//!   after `idle_timeout_ms`
//! - without WAL a reader/writer gate makes the writer exclusive
//!
//! Connection state: `Idle -> Acquired -> Idle` on release, `-> Closed`
//! once idle past the timeout or when the pool shuts down.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;

use crate::store::StoreError;

/// Connection role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

/// Opens, validates and closes connections for the pool.
///
/// The pool never touches a connection beyond these three calls, so tests
/// can drive it with a fake connection type.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(
        &self,
        role: Role,
    ) -> impl Future<Output = Result<Self::Connection, StoreError>> + Send;

    /// Cheap liveness probe run before an idle connection is handed out
    fn is_valid<'a>(
        &'a self,
        conn: &'a mut Self::Connection,
    ) -> impl Future<Output = bool> + Send + 'a;

    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send;
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Timed out after {waited_ms}ms waiting for a {role} connection")]
    Exhausted { role: Role, waited_ms: u64 },
    #[error("Connection pool is closed")]
    Closed,
    #[error("Failed to open {role} connection: {source}")]
    Connect {
        role: Role,
        #[source]
        source: StoreError,
    },
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_readers: usize,
    /// Must be 1: the store has a single writer
    pub max_writers: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Write-ahead logging, lets readers run alongside the writer
    pub enable_wal: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_readers: 5,
            max_writers: 1,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 300_000,
            enable_wal: true,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_readers == 0 {
            return Err(PoolError::InvalidConfig("max_readers must be at least 1".into()));
        }
        if self.max_writers != 1 {
            return Err(PoolError::InvalidConfig(format!(
                "max_writers must be 1 for a single-writer store, got {}",
                self.max_writers
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(PoolError::InvalidConfig("acquire_timeout_ms must be positive".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(PoolError::InvalidConfig("idle_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Per-role counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoleStats {
    pub max: usize,
    /// Open connections, idle plus in use
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Acquirers currently blocked on a slot
    pub waiting: usize,
    pub acquired_total: u64,
    pub timeouts: u64,
    pub connect_errors: u64,
    /// Connections closed for exceeding the idle timeout
    pub reaped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub readers: RoleStats,
    pub writers: RoleStats,
    pub wal_enabled: bool,
    pub closed: bool,
}

/// Result of [`ConnectionPool::health_check`]
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub healthy: bool,
    /// Time to acquire and probe a reader
    pub latency_ms: u64,
    /// Acquirers blocked on either role
    pub blocked_waiters: usize,
    pub connect_errors: u64,
    pub timeouts: u64,
    pub message: Option<String>,
}

/// Maximum time the health probe waits for a reader
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

struct IdleConn<C> {
    conn: C,
    released_at: Instant,
}

struct RoleSlots<C> {
    max: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn<C>>>,
    open: AtomicUsize,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    acquired_total: AtomicU64,
    timeouts: AtomicU64,
    connect_errors: AtomicU64,
    reaped: AtomicU64,
}

impl<C> RoleSlots<C> {
    fn new(max: usize) -> Self {
        Self {
            max,
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(VecDeque::new()),
            open: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            acquired_total: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connect_errors: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
        }
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConn<C>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove idle connections released longer than `idle_timeout` ago
    fn drain_stale(&self, idle_timeout: Duration) -> Vec<C> {
        let now = Instant::now();
        let mut idle = self.idle();
        let mut stale = Vec::new();
        let mut kept = VecDeque::with_capacity(idle.len());
        for entry in idle.drain(..) {
            if now.saturating_duration_since(entry.released_at) >= idle_timeout {
                stale.push(entry.conn);
            } else {
                kept.push_back(entry);
            }
        }
        *idle = kept;
        self.open.fetch_sub(stale.len(), Ordering::AcqRel);
        self.reaped.fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale
    }

    fn stats(&self) -> RoleStats {
        RoleStats {
            max: self.max,
            open: self.open.load(Ordering::Acquire),
            idle: self.idle().len(),
            in_use: self.in_use.load(Ordering::Acquire),
            waiting: self.waiting.load(Ordering::Acquire),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    readers: RoleSlots<M::Connection>,
    writers: RoleSlots<M::Connection>,
    /// Reader/writer exclusion when the store runs without WAL
    gate: Option<Arc<RwLock<()>>>,
    closed: AtomicBool,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn slots(&self, role: Role) -> &RoleSlots<M::Connection> {
        match role {
            Role::Reader => &self.readers,
            Role::Writer => &self.writers,
        }
    }

    fn release(&self, role: Role, conn: M::Connection, broken: bool) {
        let slots = self.slots(role);
        slots.in_use.fetch_sub(1, Ordering::AcqRel);
        if broken || self.closed.load(Ordering::Acquire) {
            slots.open.fetch_sub(1, Ordering::AcqRel);
            drop(conn);
            return;
        }
        slots.idle().push_back(IdleConn {
            conn,
            released_at: Instant::now(),
        });
    }
}

/// Keeps the acquirer counted as waiting until it has a slot or gives up
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

enum GateGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Bounded pool of reader and writer connections.
///
/// Cheap to clone; clones share the same slots.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let gate = (!config.enable_wal).then(|| Arc::new(RwLock::new(())));
        tracing::debug!(
            max_readers = config.max_readers,
            max_writers = config.max_writers,
            acquire_timeout_ms = config.acquire_timeout_ms,
            idle_timeout_ms = config.idle_timeout_ms,
            wal = config.enable_wal,
            "Connection pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                readers: RoleSlots::new(config.max_readers),
                writers: RoleSlots::new(config.max_writers),
                manager,
                config,
                gate,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Acquire a connection, waiting at most `acquire_timeout_ms` for a slot.
    pub async fn acquire(&self, role: Role) -> Result<PooledConnection<M>, PoolError> {
        self.acquire_within(role, self.inner.config.acquire_timeout())
            .await
    }

    /// Acquire with an explicit wait bound.
    ///
    /// The bound covers waiting for a slot only; opening a fresh connection
    /// after the slot is granted is not timed. A timed-out call holds no
    /// slot.
    pub async fn acquire_within(
        &self,
        role: Role,
        timeout: Duration,
    ) -> Result<PooledConnection<M>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let inner = &self.inner;
        let slots = inner.slots(role);
        let started = Instant::now();

        let waited = {
            let _waiting = WaitGuard::enter(&slots.waiting);
            tokio::time::timeout(timeout, async {
                let permit = Arc::clone(&slots.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| PoolError::Closed)?;
                let gate = match (&inner.gate, role) {
                    (None, _) => None,
                    (Some(gate), Role::Reader) => {
                        Some(GateGuard::Shared(Arc::clone(gate).read_owned().await))
                    }
                    (Some(gate), Role::Writer) => {
                        Some(GateGuard::Exclusive(Arc::clone(gate).write_owned().await))
                    }
                };
                Ok::<_, PoolError>((permit, gate))
            })
            .await
        };

        let (permit, gate) = match waited {
            Ok(result) => result?,
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                slots.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%role, waited_ms, "Connection pool exhausted");
                return Err(PoolError::Exhausted { role, waited_ms });
            }
        };

        // Close anything that sat idle too long before picking a connection
        for conn in slots.drain_stale(inner.config.idle_timeout()) {
            inner.manager.close(conn).await;
        }

        loop {
            let candidate = slots.idle().pop_back();
            let Some(mut idle) = candidate else { break };
            if inner.manager.is_valid(&mut idle.conn).await {
                return Ok(self.hand_out(role, idle.conn, permit, gate, started));
            }
            tracing::debug!(%role, "Discarding invalid idle connection");
            slots.open.fetch_sub(1, Ordering::AcqRel);
            inner.manager.close(idle.conn).await;
        }

        match inner.manager.connect(role).await {
            Ok(conn) => {
                slots.open.fetch_add(1, Ordering::AcqRel);
                Ok(self.hand_out(role, conn, permit, gate, started))
            }
            Err(source) => {
                slots.connect_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%role, error = %source, "Failed to open connection");
                Err(PoolError::Connect { role, source })
            }
        }
    }

    fn hand_out(
        &self,
        role: Role,
        conn: M::Connection,
        permit: OwnedSemaphorePermit,
        gate: Option<GateGuard>,
        started: Instant,
    ) -> PooledConnection<M> {
        let slots = self.inner.slots(role);
        slots.in_use.fetch_add(1, Ordering::AcqRel);
        slots.acquired_total.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%role, waited_us = started.elapsed().as_micros() as u64, "Connection acquired");
        PooledConnection {
            conn: Some(conn),
            role,
            broken: false,
            pool: Arc::clone(&self.inner),
            _gate: gate,
            _permit: permit,
        }
    }

    /// Close idle connections past the idle timeout. Returns how many closed.
    pub async fn reap_idle(&self) -> usize {
        let timeout = self.inner.config.idle_timeout();
        let mut closed = 0;
        for role in [Role::Reader, Role::Writer] {
            for conn in self.inner.slots(role).drain_stale(timeout) {
                self.inner.manager.close(conn).await;
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::debug!(closed, "Reaped idle connections");
        }
        closed
    }

    /// Spawn a background task that reaps idle connections every half idle
    /// timeout. The task ends when the pool is closed or dropped.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<PoolInner<M>> = Arc::downgrade(&self.inner);
        let period = (self.inner.config.idle_timeout() / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                ConnectionPool { inner }.reap_idle().await;
            }
        })
    }

    /// Close idle connections and reject further acquires. Connections in
    /// use are dropped when their handles are released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for role in [Role::Reader, Role::Writer] {
            let slots = self.inner.slots(role);
            slots.permits.close();
            let idle: Vec<_> = slots.idle().drain(..).map(|i| i.conn).collect();
            slots.open.fetch_sub(idle.len(), Ordering::AcqRel);
            for conn in idle {
                self.inner.manager.close(conn).await;
            }
        }
        tracing::info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            readers: self.inner.readers.stats(),
            writers: self.inner.writers.stats(),
            wal_enabled: self.inner.config.enable_wal,
            closed: self.is_closed(),
        }
    }

    /// Probe responsiveness by acquiring a reader and validating it.
    ///
    /// Never fails: problems are reported in the returned [`PoolHealth`].
    pub async fn health_check(&self) -> PoolHealth {
        let started = Instant::now();
        let timeout = self.inner.config.acquire_timeout().min(HEALTH_PROBE_TIMEOUT);
        let probe = match self.acquire_within(Role::Reader, timeout).await {
            Ok(mut conn) => {
                if self.inner.manager.is_valid(&mut conn).await {
                    Ok(())
                } else {
                    conn.discard();
                    Err("reader connection failed validation".to_string())
                }
            }
            Err(e) => Err(e.to_string()),
        };
        let stats = self.stats();
        let latency_ms = started.elapsed().as_millis() as u64;
        let connect_errors = stats.readers.connect_errors + stats.writers.connect_errors;
        let timeouts = stats.readers.timeouts + stats.writers.timeouts;
        let blocked_waiters = stats.readers.waiting + stats.writers.waiting;
        if let Err(ref e) = probe {
            tracing::warn!(error = %e, latency_ms, "Pool health probe failed");
        }
        PoolHealth {
            healthy: probe.is_ok(),
            latency_ms,
            blocked_waiters,
            connect_errors,
            timeouts,
            message: probe.err(),
        }
    }
}

/// A connection borrowed from the pool.
///
/// Derefs to the underlying connection. Dropping the handle returns the
/// connection to the idle list and frees the slot.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    role: Role,
    broken: bool,
    pool: Arc<PoolInner<M>>,
    // Dropped after the connection is back in the idle list
    _gate: Option<GateGuard>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Drop the connection instead of returning it to the pool, e.g. after
    /// an error that may have left it in a bad state.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("role", &self.role)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.role, conn, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fake connection: just an id
    #[derive(Debug)]
    struct FakeConn(usize);

    #[derive(Default)]
    struct FakeManager {
        opened: AtomicUsize,
        closed: AtomicUsize,
        fail_connect: AtomicBool,
        invalid: AtomicBool,
    }

    impl ConnectionManager for Arc<FakeManager> {
        type Connection = FakeConn;

        fn connect(
            &self,
            _role: Role,
        ) -> impl Future<Output = Result<FakeConn, StoreError>> + Send {
            let this = Arc::clone(self);
            async move {
                if this.fail_connect.load(Ordering::SeqCst) {
                    return Err(StoreError::Io(std::io::Error::other("refused")));
                }
                Ok(FakeConn(this.opened.fetch_add(1, Ordering::SeqCst)))
            }
        }

        fn is_valid<'a>(
            &'a self,
            _conn: &'a mut FakeConn,
        ) -> impl Future<Output = bool> + Send + 'a {
            async move { !self.invalid.load(Ordering::SeqCst) }
        }

        fn close(&self, _conn: FakeConn) -> impl Future<Output = ()> + Send {
            self.closed.fetch_add(1, Ordering::SeqCst);
            async {}
        }
    }

    fn config(max_readers: usize, acquire_ms: u64) -> PoolConfig {
        PoolConfig {
            max_readers,
            acquire_timeout_ms: acquire_ms,
            ..PoolConfig::default()
        }
    }

    fn pool(cfg: PoolConfig) -> (Arc<FakeManager>, ConnectionPool<Arc<FakeManager>>) {
        let manager = Arc::new(FakeManager::default());
        let pool = ConnectionPool::new(Arc::clone(&manager), cfg).unwrap();
        (manager, pool)
    }

    #[test]
    fn test_config_rejects_multiple_writers() {
        let cfg = PoolConfig {
            max_writers: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_rejects_zero_readers() {
        assert!(config(0, 100).validate().is_err());
    }

    #[tokio::test]
    async fn test_idle_connection_reused() {
        let (manager, pool) = pool(config(2, 100));
        let first = pool.acquire(Role::Reader).await.unwrap();
        let id = first.0;
        drop(first);
        let second = pool.acquire(Role::Reader).await.unwrap();
        assert_eq!(second.0, id);
        assert_eq!(manager.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_debug_shows_role_and_state() {
        let (_, pool) = pool(config(1, 50));
        let mut conn = pool.acquire(Role::Writer).await.unwrap();
        assert_eq!(
            format!("{conn:?}"),
            "PooledConnection { role: Writer, broken: false, .. }"
        );
        conn.discard();
        assert!(format!("{conn:?}").contains("broken: true"));
    }

    #[tokio::test]
    async fn test_reader_bound_and_timeout() {
        let (_, pool) = pool(config(2, 50));
        let a = pool.acquire(Role::Reader).await.unwrap();
        let _b = pool.acquire(Role::Reader).await.unwrap();

        let err = pool.acquire(Role::Reader).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { role: Role::Reader, .. }));

        let stats = pool.stats();
        assert_eq!(stats.readers.in_use, 2);
        assert_eq!(stats.readers.waiting, 0);
        assert_eq!(stats.readers.timeouts, 1);

        // The timed-out acquire must not have kept a slot
        drop(a);
        let again = pool.acquire(Role::Reader).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_blocked_acquire_wakes_on_release() {
        let (_, pool) = pool(config(1, 2_000));
        let held = pool.acquire(Role::Reader).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Role::Reader).await.map(|c| c.0) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().readers.waiting, 1);
        let id = held.0;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_single_writer() {
        let (_, pool) = pool(config(2, 50));
        let _w = pool.acquire(Role::Writer).await.unwrap();
        let err = pool.acquire(Role::Writer).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { role: Role::Writer, .. }));
        // WAL: readers are not blocked by the writer
        assert!(pool.acquire(Role::Reader).await.is_ok());
    }

    #[tokio::test]
    async fn test_without_wal_writer_excludes_readers() {
        let cfg = PoolConfig {
            enable_wal: false,
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        };
        let (_, pool) = pool(cfg);
        let reader = pool.acquire(Role::Reader).await.unwrap();
        assert!(pool.acquire(Role::Writer).await.is_err());
        drop(reader);
        let _writer = pool.acquire(Role::Writer).await.unwrap();
        assert!(pool.acquire(Role::Reader).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let (manager, pool) = pool(config(1, 50));
        manager.fail_connect.store(true, Ordering::SeqCst);
        let err = pool.acquire(Role::Reader).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect { .. }));
        manager.fail_connect.store(false, Ordering::SeqCst);
        assert!(pool.acquire(Role::Reader).await.is_ok());
        assert_eq!(pool.stats().readers.connect_errors, 1);
    }

    #[tokio::test]
    async fn test_invalid_idle_connection_replaced() {
        let (manager, pool) = pool(config(1, 50));
        drop(pool.acquire(Role::Reader).await.unwrap());
        manager.invalid.store(true, Ordering::SeqCst);
        let conn = pool.acquire(Role::Reader).await.unwrap();
        assert_eq!(conn.0, 1);
        assert_eq!(manager.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().readers.open, 1);
    }

    #[tokio::test]
    async fn test_discarded_connection_not_reused() {
        let (manager, pool) = pool(config(1, 50));
        let mut conn = pool.acquire(Role::Reader).await.unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.stats().readers.open, 0);
        let _ = pool.acquire(Role::Reader).await.unwrap();
        assert_eq!(manager.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_connections_reaped() {
        let cfg = PoolConfig {
            idle_timeout_ms: 20,
            ..config(3, 100)
        };
        let (manager, pool) = pool(cfg);
        let a = pool.acquire(Role::Reader).await.unwrap();
        let b = pool.acquire(Role::Reader).await.unwrap();
        drop(a);
        drop(b);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.reap_idle().await, 2);
        let stats = pool.stats();
        assert_eq!(stats.readers.open, 0);
        assert_eq!(stats.readers.reaped, 2);
        assert_eq!(manager.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let (manager, pool) = pool(config(2, 50));
        drop(pool.acquire(Role::Reader).await.unwrap());
        pool.close().await;
        assert!(matches!(
            pool.acquire(Role::Reader).await,
            Err(PoolError::Closed)
        ));
        assert_eq!(manager.closed.load(Ordering::SeqCst), 1);
        assert!(pool.stats().closed);
    }

    #[tokio::test]
    async fn test_health_check_reports_exhaustion() {
        let (_, pool) = pool(config(1, 30));
        assert!(pool.health_check().await.healthy);
        let _held = pool.acquire(Role::Reader).await.unwrap();
        let health = pool.health_check().await;
        assert!(!health.healthy);
        assert!(health.message.unwrap().contains("reader"));
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_exceed_max() {
        let (_, pool) = pool(config(3, 5_000));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            tasks.push(tokio::spawn(async move {
                let _conn = pool.acquire(Role::Reader).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().readers.in_use, 0);
    }
}

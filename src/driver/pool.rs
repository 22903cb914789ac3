//! Connection pool with admission control, health checks and a dial
//! supervisor.

use super::connection::ChConnection;
use super::dialer::{Dialer, TcpDialer};
use crate::config::ChConfig;
use crate::error::{ChError, ChResult, PoolError, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};

/// Interval between reconnect attempts while dials keep failing.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Pool counters. Reading them never blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Get calls served by an idle connection.
    pub hits: u64,
    /// Get calls that had to dial.
    pub misses: u64,
    /// Get calls that gave up waiting for admission.
    pub timeouts: u64,
    pub total_conns: usize,
    pub idle_conns: usize,
    /// Idle connections evicted by the health check.
    pub stale_conns: u64,
}

/// A checked-out connection. Returned to the pool when dropped.
///
/// Holds one admission ticket for its whole lifetime, so dropping the guard
/// (or the future that was about to produce it) always frees capacity.
pub struct PooledConnection {
    conn: Option<ChConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Close the connection instead of returning it to the idle list.
    pub fn discard(mut self, reason: &'static str) {
        if let Some(conn) = self.conn.take() {
            self.pool.remove(conn, reason);
        }
    }

    /// Hand the connection back after a request that failed with `err`.
    /// Errors that leave the stream unusable discard it; server-side
    /// rejections return it to the idle list.
    pub fn release(self, err: Option<&ChError>) {
        match err {
            Some(err) if err.is_timeout() => self.discard("timeout"),
            Some(err) if err.is_bad_conn() => self.discard("bad connection"),
            _ => drop(self),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = ChConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("Connection should always be present")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("Connection should always be present")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

/// Shared pool state.
struct PoolInner {
    config: ChConfig,
    dialer: Arc<dyn Dialer>,
    /// Most recently used last.
    idle: Mutex<Vec<ChConnection>>,
    /// Closed flags of every live connection, idle or checked out.
    tracked: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    /// Background dials reserved toward `min_idle_conns`.
    idle_dials: AtomicUsize,
    dial_errors: AtomicUsize,
    last_dial_error: Mutex<Option<String>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
    total_conns: AtomicUsize,
    idle_conns: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolInner {
    fn pool_size(&self) -> usize {
        self.config.pool.pool_size
    }

    fn pop_idle(self: &Arc<Self>) -> Option<ChConnection> {
        let conn = lock(&self.idle).pop()?;
        self.idle_conns.fetch_sub(1, Ordering::Relaxed);
        self.fill_idle();
        Some(conn)
    }

    /// Dial in the background until `min_idle_conns` connections are idle
    /// or on their way, never past the pool size.
    fn fill_idle(self: &Arc<Self>) {
        let min = self.config.pool.min_idle_conns;
        if min == 0 || self.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let wanted = {
            let idle = lock(&self.idle);
            let dialing = self.idle_dials.load(Ordering::Acquire);
            let total = self.total_conns.load(Ordering::Acquire) + dialing;
            let n = min
                .saturating_sub(idle.len() + dialing)
                .min(self.pool_size().saturating_sub(total));
            self.idle_dials.fetch_add(n, Ordering::AcqRel);
            n
        };
        for _ in 0..wanted {
            runtime.spawn(add_idle_conn(self.clone()));
        }
    }

    async fn is_healthy(&self, conn: &mut ChConnection) -> bool {
        let pool = &self.config.pool;
        if pool
            .conn_max_lifetime
            .is_some_and(|max| conn.created_at().elapsed() >= max)
        {
            return false;
        }
        if conn.used_at().elapsed() >= pool.conn_max_idle_time {
            return false;
        }
        conn.is_idle().await
    }

    fn track(&self, conn: &ChConnection) {
        lock(&self.tracked).insert(conn.id(), conn.closed_flag());
        self.total_conns.fetch_add(1, Ordering::AcqRel);
    }

    /// Return a connection to the idle list, or discard it.
    fn put(self: &Arc<Self>, mut conn: ChConnection) {
        let reason = if conn.is_closed() {
            Some("connection closed")
        } else if conn.in_exchange() {
            Some("bad connection")
        } else if conn.buffered() > 0 {
            Some("unread data")
        } else {
            None
        };
        if let Some(reason) = reason {
            self.remove(conn, reason);
            return;
        }

        conn.touch();
        let mut idle = lock(&self.idle);
        // Checked under the idle lock so close() cannot miss this conn.
        if self.closed.load(Ordering::Acquire) {
            drop(idle);
            self.remove(conn, "pool closed");
            return;
        }
        if idle.len() >= self.config.pool.max_idle_conns {
            drop(idle);
            self.remove(conn, "idle list full");
            return;
        }
        idle.push(conn);
        self.idle_conns.fetch_add(1, Ordering::Relaxed);
    }

    /// Untrack and close. The admission ticket is released by the guard.
    fn remove(self: &Arc<Self>, conn: ChConnection, reason: &'static str) {
        if lock(&self.tracked).remove(&conn.id()).is_some() {
            self.total_conns.fetch_sub(1, Ordering::AcqRel);
        }
        conn.mark_closed();
        tracing::debug!(conn = conn.id(), reason, "discarding connection");
        drop(conn);
        self.fill_idle();
    }

    /// Error returned without dialing while the server looks unreachable.
    fn dial_backoff_error(&self) -> Option<ChError> {
        if self.dial_errors.load(Ordering::Acquire) < self.pool_size() {
            return None;
        }
        let message = lock(&self.last_dial_error)
            .clone()
            .unwrap_or_else(|| "server unreachable".to_string());
        Some(
            TransportError::Dial {
                addr: self.config.addr.clone(),
                message,
            }
            .into(),
        )
    }

    async fn dial(self: &Arc<Self>) -> ChResult<ChConnection> {
        match ChConnection::connect(&self.config, self.dialer.as_ref()).await {
            Ok(conn) => {
                self.dial_errors.store(0, Ordering::Release);
                tracing::debug!(conn = conn.id(), addr = %self.config.addr, "dialed connection");
                Ok(conn)
            }
            Err(err) => {
                if let ChError::Transport(_) = err {
                    *lock(&self.last_dial_error) = Some(err.to_string());
                    let failures = self.dial_errors.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::warn!(addr = %self.config.addr, failures, error = %err, "dial failed");
                    if failures >= self.pool_size() {
                        self.start_supervisor();
                    }
                }
                Err(err)
            }
        }
    }

    /// Spawn the dial supervisor unless one is already running.
    fn start_supervisor(self: &Arc<Self>) {
        let mut slot = lock(&self.supervisor);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) || self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::info!(addr = %self.config.addr, "starting dial supervisor");
        *slot = Some(tokio::spawn(supervise_dials(Arc::downgrade(self))));
    }
}

/// Dial one connection straight into the idle list.
async fn add_idle_conn(pool: Arc<PoolInner>) {
    let dialed = match pool.dial_backoff_error() {
        Some(err) => Err(err),
        None => pool.dial().await,
    };
    let mut conn = match dialed {
        Ok(conn) => conn,
        Err(_) => {
            pool.idle_dials.fetch_sub(1, Ordering::AcqRel);
            return;
        }
    };
    pool.track(&conn);
    conn.set_pooled(true);

    let mut idle = lock(&pool.idle);
    pool.idle_dials.fetch_sub(1, Ordering::AcqRel);
    let reason = if pool.closed.load(Ordering::Acquire) {
        "pool closed"
    } else if idle.len() >= pool.config.pool.max_idle_conns {
        "idle list full"
    } else {
        idle.push(conn);
        pool.idle_conns.fetch_add(1, Ordering::Relaxed);
        return;
    };
    drop(idle);
    pool.remove(conn, reason);
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

/// Dial once per interval until the server answers, then reset the failure
/// counter. Holds only a weak reference between attempts.
async fn supervise_dials(pool: Weak<PoolInner>) {
    loop {
        tokio::time::sleep(RECONNECT_INTERVAL).await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.closed.load(Ordering::Acquire) {
            return;
        }
        if pool.dialer.dial(&pool.config.addr).await.is_ok() {
            pool.dial_errors.store(0, Ordering::Release);
            tracing::info!(addr = %pool.config.addr, "server reachable again, dial supervisor stopped");
            return;
        }
    }
}

/// Bounded pool of native-protocol connections.
///
/// # Example
/// ```ignore
/// let pool = ChPool::new(ChConfig::new("localhost:9000").pool_size(8))?;
/// let mut conn = pool.get(None).await?;
/// conn.ping(None).await?;
/// ```
#[derive(Clone)]
pub struct ChPool {
    inner: Arc<PoolInner>,
}

impl ChPool {
    /// Pool dialing over TCP (and TLS when configured).
    pub fn new(config: ChConfig) -> ChResult<Self> {
        let dialer = Arc::new(TcpDialer::new(&config)?);
        Self::with_dialer(config, dialer)
    }

    pub fn with_dialer(config: ChConfig, dialer: Arc<dyn Dialer>) -> ChResult<Self> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.pool.pool_size));
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                dialer,
                idle: Mutex::new(Vec::new()),
                tracked: Mutex::new(HashMap::new()),
                semaphore,
                closed: AtomicBool::new(false),
                idle_dials: AtomicUsize::new(0),
                dial_errors: AtomicUsize::new(0),
                last_dial_error: Mutex::new(None),
                supervisor: Mutex::new(None),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                stale: AtomicU64::new(0),
                total_conns: AtomicUsize::new(0),
                idle_conns: AtomicUsize::new(0),
            }),
        };
        pool.inner.fill_idle();
        Ok(pool)
    }

    pub fn config(&self) -> &ChConfig {
        &self.inner.config
    }

    /// Check out a connection.
    ///
    /// Waits for admission up to the pool timeout or `deadline`, whichever is
    /// sooner, then reuses the most recently used healthy idle connection or
    /// dials a new one.
    pub async fn get(&self, deadline: Option<Instant>) -> ChResult<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed.into());
        }
        if let Some(err) = inner.dial_backoff_error() {
            return Err(err);
        }
        let permit = self.acquire(deadline).await?;

        while let Some(mut conn) = inner.pop_idle() {
            if inner.is_healthy(&mut conn).await {
                inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.guard(conn, permit));
            }
            inner.stale.fetch_add(1, Ordering::Relaxed);
            inner.remove(conn, "stale");
        }

        inner.misses.fetch_add(1, Ordering::Relaxed);
        let mut conn = inner.dial().await?;
        inner.track(&conn);
        if inner.closed.load(Ordering::Acquire) {
            conn.close().await;
            inner.remove(conn, "pool closed");
            return Err(PoolError::Closed.into());
        }
        conn.set_pooled(true);
        Ok(self.guard(conn, permit))
    }

    async fn acquire(&self, deadline: Option<Instant>) -> ChResult<OwnedSemaphorePermit> {
        let timeout = self.inner.config.pool.pool_timeout;
        let configured = Instant::now() + timeout;
        let (at, caller) = match deadline {
            Some(d) if d <= configured => (d, true),
            _ => (configured, false),
        };
        match timeout_at(at, self.inner.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::Closed.into()),
            Err(_) => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                if caller {
                    Err(ChError::DeadlineExceeded)
                } else {
                    Err(PoolError::Timeout(timeout).into())
                }
            }
        }
    }

    fn guard(&self, conn: ChConnection, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            total_conns: inner.total_conns.load(Ordering::Relaxed),
            idle_conns: inner.idle_conns.load(Ordering::Relaxed),
            stale_conns: inner.stale.load(Ordering::Relaxed),
        }
    }

    /// Admission tickets not currently held.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every connection and reject further `get` calls. Checked-out
    /// connections are marked closed and discarded when released.
    ///
    /// Only the first call does any work; later calls return `Ok(())`.
    pub async fn close(&self) -> ChResult<()> {
        let inner = &self.inner;
        let idle: Vec<ChConnection> = {
            let mut idle = lock(&inner.idle);
            if inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            idle.drain(..).collect()
        };
        inner.idle_conns.store(0, Ordering::Relaxed);
        inner.semaphore.close();
        if let Some(handle) = lock(&inner.supervisor).take() {
            handle.abort();
        }

        let closed = idle.len();
        for mut conn in idle {
            conn.close().await;
            inner.remove(conn, "pool closed");
        }
        // Whatever is still tracked is checked out.
        for flag in lock(&inner.tracked).values() {
            flag.store(true, Ordering::Release);
        }
        tracing::info!(addr = %inner.config.addr, idle_closed = closed, "pool closed");
        Ok(())
    }
}

impl std::fmt::Debug for ChPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChPool")
            .field("addr", &self.inner.config.addr)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

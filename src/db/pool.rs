//! Bounded connection pool.
//!
//! The pool owns every physical connection it creates and lends them out
//! one borrower at a time. Capacity is enforced with a FIFO-fair semaphore,
//! so waiters are served first-come-first-served and every wait is bounded
//! by the caller's timeout. The idle set lives behind a plain mutex that is
//! never held across an await point.
//!
//! Lifecycle rules:
//! - a connection past `max_lifetime`, idle past `idle_timeout`, or marked
//!   broken is closed and replaced, never recycled;
//! - the capacity permit backing a lent connection is released only after
//!   the connection is back in the idle set, so a waiter can never observe
//!   free capacity while the connection is still in flight;
//! - a cancelled `acquire` returns any idle candidate it was holding, so
//!   cancellation cannot leak connections;
//! - a background reaper closes expired idle connections and tops the pool
//!   back up to `min_idle`, exiting on its own once the pool is dropped.

use crate::config::{DatabaseType, EndpointConfig};
use crate::db::factory::{ConnectionFactory, DbConnection};
use crate::error::{DbError, DbResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First delay of the connect-retry backoff during pool fill.
const CONNECT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// An idle physical connection plus its lifecycle bookkeeping.
struct IdleEntry {
    conn: DbConnection,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    config: EndpointConfig,
    factory: ConnectionFactory,
    /// Idle connections, most recently used last. Plain mutex: held only
    /// for push/pop, never across an await.
    idle: Mutex<VecDeque<IdleEntry>>,
    /// Capacity permits; tokio semaphores queue waiters FIFO.
    permits: Arc<Semaphore>,
    /// Live connections, idle and lent combined.
    total: AtomicUsize,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    /// Reserve a slot for a new connection if the pool is below max size.
    fn try_reserve_slot(&self) -> bool {
        let max = self.config.pool.max_size_or_default() as usize;
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < max { Some(n + 1) } else { None }
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    fn entry_expired(&self, entry: &IdleEntry) -> bool {
        entry.created_at.elapsed() >= self.config.pool.max_lifetime_or_default()
            || entry.last_used.elapsed() >= self.config.pool.idle_timeout_or_default()
    }

    /// Close a connection and give its slot back.
    async fn retire(inner: &Arc<Self>, conn: DbConnection) {
        inner.release_slot();
        if let Err(err) = conn.close().await {
            debug!(error = %err, "error closing retired connection");
        }
    }

    /// Pop an idle connection, retiring any expired ones on the way.
    async fn pop_idle(inner: &Arc<Self>) -> Option<IdleEntry> {
        loop {
            let candidate = { inner.idle.lock().unwrap().pop_back() };
            match candidate {
                Some(entry) if inner.entry_expired(&entry) => {
                    debug!(
                        age_ms = entry.created_at.elapsed().as_millis() as u64,
                        "retiring expired idle connection"
                    );
                    Self::retire(inner, entry.conn).await;
                }
                other => return other,
            }
        }
    }

    /// Take back a lent connection.
    ///
    /// Runs with the borrower's capacity permit still held; the caller
    /// drops the permit after this returns.
    async fn reclaim(inner: &Arc<Self>, conn: DbConnection, created_at: Instant, broken: bool) {
        if inner.closed.load(Ordering::Acquire) {
            Self::retire(inner, conn).await;
            return;
        }
        if broken || created_at.elapsed() >= inner.config.pool.max_lifetime_or_default() {
            debug!(broken, "closing returned connection instead of recycling");
            Self::retire(inner, conn).await;
            // Keep the idle floor without blocking the releasing caller.
            let topup = Arc::clone(inner);
            tokio::spawn(async move {
                Self::top_up(&topup).await;
            });
            return;
        }
        inner.idle.lock().unwrap().push_back(IdleEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        });
    }

    /// Open connections until the idle set reaches `min_idle` or capacity
    /// runs out. Best effort: a connect failure is logged and retried on
    /// the next reaper tick.
    async fn top_up(inner: &Arc<Self>) {
        let min_idle = inner.config.pool.min_idle_or_default() as usize;
        loop {
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            let idle_count = inner.idle.lock().unwrap().len();
            if idle_count >= min_idle {
                return;
            }
            if !inner.try_reserve_slot() {
                return;
            }
            match inner.factory.open().await {
                Ok(conn) => {
                    if inner.closed.load(Ordering::Acquire) {
                        // Shutdown raced the open; don't strand the
                        // connection in a drained idle set.
                        Self::retire(inner, conn).await;
                        return;
                    }
                    let now = Instant::now();
                    inner.idle.lock().unwrap().push_back(IdleEntry {
                        conn,
                        created_at: now,
                        last_used: now,
                    });
                }
                Err(err) => {
                    inner.release_slot();
                    warn!(error = %err, "failed to top up idle connections");
                    return;
                }
            }
        }
    }

    /// Periodic scan: retire idle connections past their lifetime or idle
    /// timeout, then restore the idle floor.
    async fn reap(inner: &Arc<Self>) {
        let expired: Vec<IdleEntry> = {
            let mut idle = inner.idle.lock().unwrap();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut out = Vec::new();
            while let Some(entry) = idle.pop_front() {
                if inner.entry_expired(&entry) {
                    out.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
            out
        }; // Lock released here; close outside it.

        for entry in expired {
            info!(
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                idle_ms = entry.last_used.elapsed().as_millis() as u64,
                "reaper closing idle connection"
            );
            Self::retire(inner, entry.conn).await;
        }

        Self::top_up(inner).await;
    }

    /// Background reaper loop. Holds only a weak handle so the pool can be
    /// dropped while the task is alive; the task exits on the next tick.
    async fn reaper_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                debug!("pool dropped, reaper exiting");
                return;
            };
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            Self::reap(&inner).await;
            drop(inner);
        }
    }
}

/// Drop-safe holder for an idle candidate during validation.
///
/// An `acquire` future can be cancelled between popping an idle entry and
/// handing it to the caller; on drop the candidate goes back to the idle
/// set instead of leaking.
struct IdleLease {
    inner: Arc<PoolInner>,
    entry: Option<IdleEntry>,
}

impl IdleLease {
    async fn ping(&mut self) -> bool {
        match self.entry.as_mut() {
            Some(entry) => entry.conn.ping().await.is_ok(),
            None => false,
        }
    }

    fn take(mut self) -> Option<IdleEntry> {
        self.entry.take()
    }

    async fn discard(mut self) {
        if let Some(entry) = self.entry.take() {
            PoolInner::retire(&self.inner, entry.conn).await;
        }
    }
}

impl Drop for IdleLease {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            if self.inner.closed.load(Ordering::Acquire) {
                // Shutdown already drained the idle set; the connection
                // closes on drop.
                self.inner.release_slot();
                return;
            }
            entry.last_used = Instant::now();
            self.inner.idle.lock().unwrap().push_back(entry);
        }
    }
}

/// A bounded pool of reusable physical connections to one endpoint.
///
/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool and validate the endpoint by opening one connection.
    ///
    /// The validated connection is parked in the idle set; the idle floor
    /// is then topped up best-effort and a background reaper is started.
    pub async fn connect(config: EndpointConfig) -> DbResult<Self> {
        config.pool.validate()?;
        let factory = ConnectionFactory::new(config.clone());
        let max = config.pool.max_size_or_default() as usize;
        let reap_interval = config.pool.reap_interval_or_default();

        let inner = Arc::new(PoolInner {
            config,
            factory,
            idle: Mutex::new(VecDeque::with_capacity(max)),
            permits: Arc::new(Semaphore::new(max)),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        // Fail fast on a bad endpoint rather than at first acquire.
        let conn = inner.factory.open().await?;
        if inner.try_reserve_slot() {
            let now = Instant::now();
            inner.idle.lock().unwrap().push_back(IdleEntry {
                conn,
                created_at: now,
                last_used: now,
            });
        }
        PoolInner::top_up(&inner).await;

        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(PoolInner::reaper_task(weak, reap_interval));
        {
            let mut guard = inner.reaper.lock().unwrap();
            *guard = Some(handle);
        }

        info!(
            endpoint = %inner.config.masked_url(),
            max_size = inner.config.pool.max_size_or_default(),
            min_idle = inner.config.pool.min_idle_or_default(),
            "connection pool ready"
        );
        Ok(Self { inner })
    }

    /// Borrow a connection, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquire_timeout(self.inner.config.pool.acquire_timeout_or_default())
            .await
    }

    /// Borrow a connection, waiting at most `timeout`.
    ///
    /// Fails with [`DbError::PoolExhausted`] when capacity stays saturated
    /// past the deadline, [`DbError::PoolClosed`] after shutdown, or
    /// [`DbError::Connect`] when opening a fresh connection kept failing
    /// until the deadline.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }

        let start = Instant::now();
        let deadline = start + timeout;

        let permit = match tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            Arc::clone(&inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolClosed),
            Err(_) => return Err(DbError::pool_exhausted(start.elapsed())),
        };
        if inner.closed.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }

        let backoff_cap = inner.config.pool.connect_backoff_cap_or_default();
        let mut delay = CONNECT_RETRY_INITIAL_DELAY;
        loop {
            // Reuse an idle connection when one survives the checks.
            while let Some(entry) = PoolInner::pop_idle(inner).await {
                let mut lease = IdleLease {
                    inner: Arc::clone(inner),
                    entry: Some(entry),
                };
                if inner.config.pool.test_on_acquire_or_default() && !lease.ping().await {
                    debug!("idle connection failed validation ping, retiring");
                    lease.discard().await;
                    continue;
                }
                if let Some(entry) = lease.take() {
                    debug!(
                        age_ms = entry.created_at.elapsed().as_millis() as u64,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "reusing idle connection"
                    );
                    return Ok(PooledConnection::new(
                        entry.conn,
                        entry.created_at,
                        Arc::clone(inner),
                        permit,
                    ));
                }
            }

            // Nothing idle: open a fresh connection if capacity allows,
            // backing off on connect failures until the deadline.
            if inner.try_reserve_slot() {
                match inner.factory.open().await {
                    Ok(conn) => {
                        debug!(
                            waited_ms = start.elapsed().as_millis() as u64,
                            "opened fresh connection for borrower"
                        );
                        return Ok(PooledConnection::new(
                            conn,
                            Instant::now(),
                            Arc::clone(inner),
                            permit,
                        ));
                    }
                    Err(err) => {
                        inner.release_slot();
                        if Instant::now() + delay >= deadline {
                            warn!(error = %err, "giving up on connect retries at acquire deadline");
                            return Err(err);
                        }
                        warn!(
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "connect failed during pool fill, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(backoff_cap);
                    }
                }
            } else {
                if Instant::now() >= deadline {
                    return Err(DbError::pool_exhausted(start.elapsed()));
                }
                // Capacity raced away (reaper top-up in flight); wait
                // briefly for it to land in the idle set.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            if inner.closed.load(Ordering::Acquire) {
                return Err(DbError::PoolClosed);
            }
        }
    }

    /// Shut the pool down.
    ///
    /// Idle connections are closed immediately and subsequent `acquire`
    /// calls fail with [`DbError::PoolClosed`]. Connections still lent out
    /// are closed as they come back; `shutdown` waits up to `grace` for
    /// that to happen.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();
        if let Some(handle) = inner.reaper.lock().unwrap().take() {
            handle.abort();
        }

        let drained: Vec<IdleEntry> = { inner.idle.lock().unwrap().drain(..).collect() };
        for entry in drained {
            PoolInner::retire(inner, entry.conn).await;
        }

        let deadline = Instant::now() + grace;
        while inner.total.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = inner.total.load(Ordering::Acquire);
        if remaining > 0 {
            warn!(
                remaining,
                "pool shutdown grace period elapsed with connections still lent out"
            );
        }
        info!("connection pool shut down");
    }

    /// Get the backend type served by this pool.
    pub fn db_type(&self) -> DatabaseType {
        self.inner.config.db_type
    }

    /// Get the endpoint configuration.
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Live connections, idle and lent combined.
    pub fn size(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Connections currently parked in the idle set.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Whether `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.inner.config.masked_url())
            .field("db_type", &self.inner.config.db_type)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection borrowed from the pool.
///
/// Exactly one borrower holds it at a time. Prefer the explicit
/// `release().await` over relying on `Drop`: the drop path has to spawn a
/// task to run the asynchronous return.
pub struct PooledConnection {
    conn: Option<DbConnection>,
    created_at: Instant,
    broken: bool,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(
        conn: DbConnection,
        created_at: Instant,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            broken: false,
            pool,
            permit: Some(permit),
        }
    }

    /// Get the underlying connection.
    pub fn connection(&self) -> &DbConnection {
        self.conn
            .as_ref()
            .expect("BUG: pooled connection used after release")
    }

    /// Get mutable access to the underlying connection.
    pub fn connection_mut(&mut self) -> &mut DbConnection {
        self.conn
            .as_mut()
            .expect("BUG: pooled connection used after release")
    }

    /// Mark the connection as broken; the pool will close it on release
    /// instead of recycling it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection has been marked broken.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Age of the underlying physical connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Backend type of the underlying connection.
    pub fn db_type(&self) -> DatabaseType {
        self.connection().db_type()
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        let Some(conn) = self.conn.take() else { return };
        let permit = self.permit.take();
        PoolInner::reclaim(&self.pool, conn, self.created_at, self.broken).await;
        // Free the capacity slot only once the connection is back.
        drop(permit);
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = DbConnection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection_mut()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("age_ms", &(self.created_at.elapsed().as_millis() as u64))
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);
        let created_at = self.created_at;
        let broken = self.broken;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                PoolInner::reclaim(&pool, conn, created_at, broken).await;
                drop(permit);
            });
        } else {
            // Runtime already gone (process shutdown): the connection
            // closes on drop and no new acquires can race for the slot.
            pool.release_slot();
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner(max_size: u32) -> Arc<PoolInner> {
        let config =
            EndpointConfig::parse(&format!("sqlite:test.db?max_size={}", max_size)).unwrap();
        let factory = ConnectionFactory::new(config.clone());
        Arc::new(PoolInner {
            config,
            factory,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_size as usize)),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        })
    }

    #[test]
    fn test_reserve_slot_respects_max() {
        let inner = test_inner(2);
        assert!(inner.try_reserve_slot());
        assert!(inner.try_reserve_slot());
        assert!(!inner.try_reserve_slot());
        inner.release_slot();
        assert!(inner.try_reserve_slot());
    }

    #[test]
    fn test_pool_exhausted_error_reports_wait() {
        let err = DbError::pool_exhausted(Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_pop_idle_on_empty_set() {
        let inner = test_inner(2);
        tokio_test::block_on(async {
            assert!(PoolInner::pop_idle(&inner).await.is_none());
        });
    }
}

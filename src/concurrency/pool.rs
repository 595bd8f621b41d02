//! Bounded pool of reusable downstream connections with idle expiry.
//!
//! `active_connections` counts every live connection the pool is responsible
//! for, idle or checked out, and never exceeds `max_size`. Connections are
//! created lazily through the factory and handed out as [`PooledConnection`]
//! guards that go back to the pool when dropped.

use std::any::Any;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;

/// Idle time after which a pooled connection is discarded.
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(300); // 5 minutes

/// A resource the pool can hand out and later dispose of.
#[async_trait]
pub trait PoolConnection: Send + Sync + 'static {
    /// Release the underlying resource. Called once, when the pool drops it.
    async fn close(&self) {}
}

type Factory<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

struct IdleConnection<C> {
    conn: C,
    last_used: Instant,
}

struct PoolState<C> {
    /// Most recently returned connection last.
    idle: Vec<IdleConnection<C>>,
    active: usize,
    /// Bumped by `close_all()`; guards from an older generation are closed on return.
    generation: u64,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub max_size: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub in_use: usize,
    pub max_idle_time_secs: u64,
}

/// Generic connection pool.
pub struct ConnectionPool<C: PoolConnection> {
    name: String,
    max_size: usize,
    max_idle_time: Duration,
    factory: Factory<C>,
    state: Mutex<PoolState<C>>,
    available: Notify,
}

impl<C: PoolConnection> ConnectionPool<C> {
    /// Create an empty pool. `max_size` is clamped to at least one.
    pub fn new<F, Fut>(name: impl Into<String>, max_size: usize, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        Self::with_idle_timeout(name, max_size, DEFAULT_MAX_IDLE_TIME, factory)
    }

    pub fn with_idle_timeout<F, Fut>(
        name: impl Into<String>,
        max_size: usize,
        max_idle_time: Duration,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let factory: Factory<C> = Arc::new(move || Box::pin(factory()));
        Self {
            name: name.into(),
            max_size: max_size.max(1),
            max_idle_time,
            factory,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: 0,
                generation: 0,
            }),
            available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Live connections, idle or checked out.
    pub fn active_connections(&self) -> usize {
        self.lock_state().active
    }

    pub fn idle_connections(&self) -> usize {
        self.lock_state().idle.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection, waiting while the pool is saturated.
    ///
    /// The returned guard puts the connection back when dropped, including
    /// when the holding future is cancelled.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>> {
        let (conn, generation) = self.get_connection().await?;
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            generation,
            checked_out_at: Instant::now(),
        })
    }

    async fn get_connection(&self) -> Result<(C, u64)> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut expired = Vec::new();
            let (checkout, generation) = {
                let mut state = self.lock_state();
                let mut reused = None;
                while let Some(idle) = state.idle.pop() {
                    if idle.last_used.elapsed() < self.max_idle_time {
                        reused = Some(idle.conn);
                        break;
                    }
                    state.active -= 1;
                    expired.push(idle.conn);
                }

                let checkout = match reused {
                    Some(conn) => Checkout::Reused(conn),
                    None if state.active < self.max_size => {
                        state.active += 1;
                        Checkout::Create
                    }
                    None => Checkout::Wait,
                };
                (checkout, state.generation)
            };

            if !expired.is_empty() {
                debug!(pool = %self.name, count = expired.len(), "Discarding idle connections");
                for conn in expired {
                    conn.close().await;
                }
                self.available.notify_waiters();
            }

            match checkout {
                Checkout::Reused(conn) => return Ok((conn, generation)),
                Checkout::Create => {
                    let mut slot = SlotReservation {
                        pool: self,
                        generation,
                        armed: true,
                    };
                    let conn = (self.factory)().await?;
                    slot.armed = false;
                    debug!(pool = %self.name, "Created connection");
                    return Ok((conn, generation));
                }
                Checkout::Wait => notified.await,
            }
        }
    }

    fn return_connection(&self, conn: C, generation: u64, last_used: Instant) {
        let mut state = self.lock_state();
        if state.generation != generation {
            drop(state);
            close_detached(conn);
            return;
        }

        if last_used.elapsed() >= self.max_idle_time {
            state.active -= 1;
            drop(state);
            debug!(pool = %self.name, "Closing stale connection on return");
            close_detached(conn);
        } else {
            state.idle.push(IdleConnection {
                conn,
                last_used: Instant::now(),
            });
            drop(state);
        }
        self.available.notify_one();
    }

    fn release_slot(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.active -= 1;
        }
        drop(state);
        self.available.notify_one();
    }

    /// Close every idle connection whose idle time has run out.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<C> = {
            let mut state = self.lock_state();
            let max_idle = self.max_idle_time;
            let (keep, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| idle.last_used.elapsed() < max_idle);
            state.idle = keep;
            state.active -= expired.len();
            expired.into_iter().map(|idle| idle.conn).collect()
        };

        let count = expired.len();
        for conn in expired {
            conn.close().await;
        }
        if count > 0 {
            debug!(pool = %self.name, count, "Evicted idle connections");
            self.available.notify_waiters();
        }
        count
    }

    /// Close all pooled connections and reset the active count.
    pub async fn close_all(&self) -> usize {
        let idle = {
            let mut state = self.lock_state();
            state.active = 0;
            state.generation += 1;
            std::mem::take(&mut state.idle)
        };

        let count = idle.len();
        for entry in idle {
            entry.conn.close().await;
        }
        self.available.notify_waiters();
        info!(pool = %self.name, closed = count, "Connection pool closed");
        count
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            name: self.name.clone(),
            max_size: self.max_size,
            active_connections: state.active,
            idle_connections: state.idle.len(),
            in_use: state.active.saturating_sub(state.idle.len()),
            max_idle_time_secs: self.max_idle_time.as_secs(),
        }
    }
}

enum Checkout<C> {
    Reused(C),
    Create,
    Wait,
}

/// Capacity reserved for a connection still being created.
struct SlotReservation<'a, C: PoolConnection> {
    pool: &'a ConnectionPool<C>,
    generation: u64,
    armed: bool,
}

impl<C: PoolConnection> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(self.generation);
        }
    }
}

fn close_detached<C: PoolConnection>(conn: C) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.close().await });
    }
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PooledConnection<'a, C: PoolConnection> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
    generation: u64,
    checked_out_at: Instant,
}

impl<C: PoolConnection> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C: PoolConnection> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C: PoolConnection> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .return_connection(conn, self.generation, self.checked_out_at);
        }
    }
}

/// Type-erased pool handle so the processor can hold pools of any connection type.
#[async_trait]
pub trait ManagedPool: Send + Sync {
    fn stats(&self) -> PoolStats;
    async fn evict_idle(&self) -> usize;
    async fn close_all(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<C: PoolConnection> ManagedPool for ConnectionPool<C> {
    fn stats(&self) -> PoolStats {
        ConnectionPool::stats(self)
    }

    async fn evict_idle(&self) -> usize {
        ConnectionPool::evict_idle(self).await
    }

    async fn close_all(&self) -> usize {
        ConnectionPool::close_all(self).await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::{Error, PoolError};

    #[derive(Debug)]
    struct FakeConn {
        id: usize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PoolConnection for FakeConn {
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        pool: ConnectionPool<FakeConn>,
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    fn harness(max_size: usize) -> Harness {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (c, d) = (Arc::clone(&created), Arc::clone(&closed));
        let pool = ConnectionPool::new("test", max_size, move || {
            let id = c.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::clone(&d);
            async move { Ok(FakeConn { id, closed }) }
        });
        Harness {
            pool,
            created,
            closed,
        }
    }

    #[tokio::test]
    async fn creates_connection_lazily() {
        let h = harness(3);
        assert_eq!(h.pool.active_connections(), 0);
        {
            let conn = h.pool.acquire().await.unwrap();
            assert_eq!(conn.id, 0);
            assert_eq!(h.pool.active_connections(), 1);
        }
        assert_eq!(h.pool.idle_connections(), 1);
    }

    #[tokio::test]
    async fn reuses_returned_connection() {
        let h = harness(3);
        let first = h.pool.acquire().await.unwrap().id;
        let second = h.pool.acquire().await.unwrap().id;
        assert_eq!(first, second);
        assert_eq!(h.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn respects_max_size_under_concurrency() {
        let h = Arc::new(harness(3));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let h = Arc::clone(&h);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _conn = h.pool.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(h.pool.active_connections() <= 3);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(h.created.load(Ordering::SeqCst) <= 3);
        assert!(h.pool.active_connections() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_idle_connection_is_replaced() {
        let h = harness(3);
        let first = h.pool.acquire().await.unwrap().id;

        tokio::time::advance(Duration::from_secs(400)).await;

        let conn = h.pool.acquire().await.unwrap();
        assert_ne!(conn.id, first);
        assert_eq!(h.pool.idle_connections(), 0);
        assert_eq!(h.pool.active_connections(), 1);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_sweeps_expired() {
        let h = harness(3);
        {
            let _a = h.pool.acquire().await.unwrap();
            let _b = h.pool.acquire().await.unwrap();
        }
        assert_eq!(h.pool.idle_connections(), 2);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(h.pool.evict_idle().await, 2);
        assert_eq!(h.pool.active_connections(), 0);
    }

    #[tokio::test]
    async fn close_all_drains_pool() {
        let h = harness(3);
        {
            let _a = h.pool.acquire().await.unwrap();
            let _b = h.pool.acquire().await.unwrap();
        }
        assert_eq!(h.pool.idle_connections(), 2);

        assert_eq!(h.pool.close_all().await, 2);
        assert_eq!(h.pool.idle_connections(), 0);
        assert_eq!(h.pool.active_connections(), 0);
        assert_eq!(h.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connection_out_during_close_all_is_not_repooled() {
        let h = harness(2);
        let conn = h.pool.acquire().await.unwrap();
        h.pool.close_all().await;
        drop(conn);

        assert_eq!(h.pool.active_connections(), 0);
        assert_eq!(h.pool.idle_connections(), 0);
    }

    #[tokio::test]
    async fn factory_failure_releases_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let pool: ConnectionPool<FakeConn> = ConnectionPool::new("flaky", 1, move || {
            let n = a.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Pool(PoolError::ConnectionFailed {
                        pool: "flaky".into(),
                        reason: "refused".into(),
                    }))
                } else {
                    Ok(FakeConn {
                        id: n,
                        closed: Arc::new(AtomicUsize::new(0)),
                    })
                }
            }
        });

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, Error::Pool(PoolError::ConnectionFailed { .. })));
        assert_eq!(pool.active_connections(), 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
    }

    #[tokio::test]
    async fn waiter_wakes_when_connection_returned() {
        let h = Arc::new(harness(1));
        let held = h.pool.acquire().await.unwrap();
        let held_id = held.id;

        let waiter = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.pool.acquire().await.unwrap().id })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), held_id);
    }
}

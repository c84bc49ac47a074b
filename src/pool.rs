//! Bounded connection pool for the network tiers.
//!
//! One pool per network backend. A connection is either idle in the pool or
//! leased to exactly one caller; the lease is a guard that returns the
//! connection on drop. Released connections are pinged before they are
//! parked idle again, and a lease marked broken is closed instead of
//! returned, so `acquire` never hands out a connection that already failed.
//!
//! Waiters block on a condvar with a bounded deadline; when the pool is
//! saturated past `max` for the whole wait, `acquire` reports
//! `PoolExhausted`.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::{NetworkConfig, PoolConfig};
use crate::error::{CacheError, CacheResult};

/// Opens and health-checks connections for one backend.
pub trait Connector: Send + Sync + 'static {
    /// The connection handle being pooled.
    type Conn: Send;

    /// Backend label for errors and logs.
    fn backend(&self) -> &'static str;

    /// Open a fresh connection. Called outside the pool lock.
    ///
    /// # Errors
    ///
    /// Propagates the backend's connect failure.
    fn connect(&self) -> CacheResult<Self::Conn>;

    /// Cheap liveness test run before a released connection is parked idle.
    fn ping(&self, conn: &mut Self::Conn) -> bool;
}

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    last_used_at: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    leased: usize,
    open: bool,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    /// Connections parked in the pool.
    pub idle: usize,
    /// Connections currently leased out.
    pub leased: usize,
    /// Configured ceiling.
    pub max: usize,
}

/// Bounded, leased, idle-aged connection pool.
pub struct ConnectionPool<K: Connector> {
    connector: K,
    config: PoolConfig,
    /// Bound on how long `acquire` may block waiting for a free slot.
    acquire_timeout: Duration,
    /// Connect retry policy, applied outside the lock.
    retry_attempts: u32,
    retry_delay: Duration,
    /// When false, released connections are closed instead of pooled.
    recycle: bool,
    state: Mutex<PoolState<K::Conn>>,
    available: Condvar,
}

impl<K: Connector> ConnectionPool<K> {
    /// Build a pool from the backend's network config section.
    pub fn new(connector: K, network: &NetworkConfig) -> Self {
        Self {
            connector,
            config: network.pool.clone(),
            acquire_timeout: network.connect_timeout(),
            retry_attempts: network.retry_attempts,
            retry_delay: network.retry_delay(),
            recycle: network.persistent,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                leased: 0,
                open: true,
            }),
            available: Condvar::new(),
        }
    }

    /// Open connections until `min` exist. Used at discovery so the first
    /// request does not pay the connect cost.
    ///
    /// # Errors
    ///
    /// Propagates the first connect failure; connections opened before the
    /// failure stay pooled.
    pub fn warm_up(&self) -> CacheResult<()> {
        loop {
            {
                let state = self.state.lock();
                if state.idle.len() + state.leased >= self.config.min {
                    return Ok(());
                }
            }
            let conn = self.connect_with_retry()?;
            let now = Instant::now();
            let mut state = self.state.lock();
            state.open = true;
            state.idle.push_back(IdleConn {
                conn,
                created_at: now,
                last_used_at: now,
            });
            self.available.notify_one();
        }
    }

    /// Lease a connection: idle first, then a fresh one up to `max`, then a
    /// bounded wait for a release.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` when the wait deadline passes with the pool still
    /// saturated; connect errors propagate as-is.
    pub fn acquire(&self) -> CacheResult<PooledConn<'_, K>> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut state = self.state.lock();
        // The engine re-initializes lazily after close(); the first acquire
        // reopens the pool.
        state.open = true;

        loop {
            if let Some(entry) = state.idle.pop_front() {
                state.leased += 1;
                drop(state);
                return Ok(PooledConn {
                    pool: self,
                    conn: Some(entry.conn),
                    created_at: entry.created_at,
                    broken: false,
                });
            }

            if state.leased < self.config.max {
                state.leased += 1;
                drop(state);
                return match self.connect_with_retry() {
                    Ok(conn) => Ok(PooledConn {
                        pool: self,
                        conn: Some(conn),
                        created_at: Instant::now(),
                        broken: false,
                    }),
                    Err(err) => {
                        let mut state = self.state.lock();
                        state.leased -= 1;
                        drop(state);
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }

            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Err(CacheError::PoolExhausted {
                    backend: self.connector.backend(),
                });
            }
        }
    }

    /// Close idle connections older than `idle_timeout`, never dropping the
    /// pool below `min`. Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut reaped = Vec::new();
        {
            let mut state = self.state.lock();
            while state.idle.len() + state.leased > self.config.min {
                match state.idle.front() {
                    Some(entry)
                        if now.duration_since(entry.last_used_at) > self.config.idle_timeout() =>
                    {
                        if let Some(entry) = state.idle.pop_front() {
                            reaped.push(entry);
                        }
                    }
                    _ => break,
                }
            }
        }
        let count = reaped.len();
        if count > 0 {
            debug!(
                backend = self.connector.backend(),
                count, "reaped idle connections"
            );
        }
        drop(reaped);
        count
    }

    /// Drain every idle connection and mark the pool closed. Leased
    /// connections are closed as they come back.
    pub fn close_all(&self) {
        let drained: Vec<IdleConn<K::Conn>> = {
            let mut state = self.state.lock();
            state.open = false;
            state.idle.drain(..).collect()
        };
        self.available.notify_all();
        debug!(
            backend = self.connector.backend(),
            count = drained.len(),
            "drained connection pool"
        );
        drop(drained);
    }

    /// Current occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            max: self.config.max,
        }
    }

    fn connect_with_retry(&self) -> CacheResult<K::Conn> {
        let mut attempt = 0;
        loop {
            match self.connector.connect() {
                Ok(conn) => return Ok(conn),
                Err(err) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(
                        backend = self.connector.backend(),
                        attempt,
                        error = %err,
                        "connect failed, retrying"
                    );
                    std::thread::sleep(self.retry_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn give_back(&self, conn: Option<K::Conn>, created_at: Instant, broken: bool) {
        let Some(mut conn) = conn else {
            let mut state = self.state.lock();
            state.leased -= 1;
            drop(state);
            self.available.notify_one();
            return;
        };

        let recycle = {
            let state = self.state.lock();
            state.open && self.recycle && !broken
        };
        // Ping outside the lock; a slow backend must not stall other leases.
        let healthy = recycle && self.connector.ping(&mut conn);

        let mut state = self.state.lock();
        state.leased -= 1;
        if healthy && state.open {
            state.idle.push_back(IdleConn {
                conn,
                created_at,
                last_used_at: Instant::now(),
            });
        } else {
            drop(state);
            drop(conn);
            self.available.notify_one();
            return;
        }
        drop(state);
        self.available.notify_one();
    }
}

/// Exclusive lease of one pooled connection. Dropping the guard releases
/// the connection; call [`PooledConn::discard`] instead when the backend
/// reported a broken connection so the pool closes it.
pub struct PooledConn<'a, K: Connector> {
    pool: &'a ConnectionPool<K>,
    conn: Option<K::Conn>,
    created_at: Instant,
    broken: bool,
}

impl<K: Connector> PooledConn<'_, K> {
    /// Mark the connection broken and return it for closing.
    pub fn discard(mut self) {
        self.broken = true;
        // Drop handles the give-back.
    }
}

impl<K: Connector> Deref for PooledConn<'_, K> {
    type Target = K::Conn;

    fn deref(&self) -> &Self::Target {
        #[allow(clippy::expect_used)]
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<K: Connector> DerefMut for PooledConn<'_, K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        #[allow(clippy::expect_used)]
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<K: Connector> Drop for PooledConn<'_, K> {
    fn drop(&mut self) {
        self.pool
            .give_back(self.conn.take(), self.created_at, self.broken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeConnector {
        opened: AtomicUsize,
        refuse: AtomicBool,
        fail_ping: AtomicBool,
    }

    impl FakeConnector {
        fn new() -> Self {
            Self {
                opened: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                fail_ping: AtomicBool::new(false),
            }
        }
    }

    struct FakeConn(#[allow(dead_code)] usize);

    impl Connector for Arc<FakeConnector> {
        type Conn = FakeConn;

        fn backend(&self) -> &'static str {
            "fake"
        }

        fn connect(&self) -> CacheResult<FakeConn> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(CacheError::ConnectionLost("refused".into()));
            }
            Ok(FakeConn(self.opened.fetch_add(1, Ordering::SeqCst)))
        }

        fn ping(&self, _conn: &mut FakeConn) -> bool {
            !self.fail_ping.load(Ordering::SeqCst)
        }
    }

    fn network(max: usize) -> NetworkConfig {
        let mut net = NetworkConfig::redis_defaults();
        net.pool = PoolConfig {
            min: 1,
            max,
            idle_timeout_seconds: 0,
        };
        net.connect_timeout_seconds = 0;
        net.retry_attempts = 0;
        net.retry_delay_millis = 0;
        net
    }

    #[test]
    fn acquire_reuses_released_connections() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone(), &network(2));

        drop(pool.acquire().expect("first lease"));
        drop(pool.acquire().expect("second lease"));

        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
    }

    #[test]
    fn saturated_pool_reports_exhausted_then_recovers() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector, &network(1));

        let lease = pool.acquire().expect("lease");
        assert!(matches!(
            pool.acquire(),
            Err(CacheError::PoolExhausted { backend: "fake" })
        ));

        drop(lease);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn occupancy_never_exceeds_max_under_contention() {
        let connector = Arc::new(FakeConnector::new());
        let pool = Arc::new(ConnectionPool::new(connector, &network(4)));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for _ in 0..12_500 {
                        if let Ok(lease) = pool.acquire() {
                            let stats = pool.stats();
                            assert!(stats.idle + stats.leased <= stats.max);
                            drop(lease);
                        }
                    }
                });
            }
        });

        let stats = pool.stats();
        assert!(stats.idle + stats.leased <= stats.max);
        assert_eq!(stats.leased, 0);
    }

    #[test]
    fn failed_ping_closes_instead_of_pooling() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone(), &network(2));

        connector.fail_ping.store(true, Ordering::SeqCst);
        drop(pool.acquire().expect("lease"));
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn discard_drops_broken_connection() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone(), &network(2));

        pool.acquire().expect("lease").discard();
        assert_eq!(pool.stats().idle, 0);

        // Next acquire opens a fresh connection.
        drop(pool.acquire().expect("lease"));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reap_idle_respects_min() {
        let connector = Arc::new(FakeConnector::new());
        let mut net = network(4);
        net.pool.min = 1;
        let pool = ConnectionPool::new(connector, &net);

        let a = pool.acquire().expect("a");
        let b = pool.acquire().expect("b");
        let c = pool.acquire().expect("c");
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.stats().idle, 3);
        std::thread::sleep(Duration::from_millis(5));

        // idle_timeout is zero, so everything above min is reapable.
        let reaped = pool.reap_idle();
        assert_eq!(reaped, 2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn connect_failure_frees_the_reserved_slot() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone(), &network(1));

        connector.refuse.store(true, Ordering::SeqCst);
        assert!(pool.acquire().is_err());

        connector.refuse.store(false, Ordering::SeqCst);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn close_all_drains_and_reopens_on_demand() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector, &network(2));

        drop(pool.acquire().expect("lease"));
        assert_eq!(pool.stats().idle, 1);

        pool.close_all();
        assert_eq!(pool.stats().idle, 0);

        // Next acquire reopens.
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn warm_up_fills_to_min() {
        let connector = Arc::new(FakeConnector::new());
        let mut net = network(4);
        net.pool.min = 3;
        let pool = ConnectionPool::new(connector, &net);

        pool.warm_up().expect("warm up");
        assert_eq!(pool.stats().idle, 3);
    }
}

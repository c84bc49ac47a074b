//! Memcached network tier over pooled clients.
//!
//! Memcached cannot introspect remaining TTLs, so hits report
//! `remaining_ttl: None` and promotion falls back to its default bound.
//! It cannot enumerate keys either: `clear` deletes the keys this engine
//! instance has written (tracked in an in-engine index) and leaves anything
//! older to expire naturally, rather than flushing the whole server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::config::NetworkConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::pool::{ConnectionPool, Connector, PooledConn, PoolStats};
use crate::tier::Tier;

/// Opens Memcached clients for the pool. Each pooled "connection" is one
/// client bound to a single server socket.
pub struct MemcachedConnector {
    url: String,
}

impl Connector for MemcachedConnector {
    type Conn = memcache::Client;

    fn backend(&self) -> &'static str {
        "memcached"
    }

    fn connect(&self) -> CacheResult<memcache::Client> {
        let client = memcache::connect(self.url.as_str())?;
        // Round-trip the version command so a dead server fails here, not
        // on the first cache operation.
        client.version()?;
        Ok(client)
    }

    fn ping(&self, conn: &mut memcache::Client) -> bool {
        conn.version().is_ok()
    }
}

/// Memcached tier.
pub struct MemcachedAdapter {
    keys: Arc<KeyManager>,
    pool: ConnectionPool<MemcachedConnector>,
    /// Caller keys written through this instance; the only handle a
    /// namespace-scoped clear has on an enumeration-less backend.
    written: DashMap<String, ()>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl MemcachedAdapter {
    /// Create the Memcached tier. No connection is opened until the first
    /// probe or operation.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, config: &NetworkConfig) -> Self {
        let url = format!(
            "memcache://{host}:{port}?timeout={timeout}&tcp_nodelay=true",
            host = config.host,
            port = config.port,
            timeout = config.read_timeout_seconds.max(1)
        );
        info!(url = %url, "[memcached] tier configured");
        Self {
            keys,
            pool: ConnectionPool::new(MemcachedConnector { url }, config),
            written: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Pool occupancy for status reporting.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn fail(conn: PooledConn<'_, MemcachedConnector>, err: memcache::MemcacheError) -> CacheError {
        let mapped: CacheError = err.into();
        if matches!(
            mapped,
            CacheError::ConnectionLost(_) | CacheError::ConnectionTimeout(_) | CacheError::Io(_)
        ) {
            conn.discard();
        }
        mapped
    }
}

impl TierAdapter for MemcachedAdapter {
    fn tier(&self) -> Tier {
        Tier::Memcached
    }

    fn probe(&self) -> CacheResult<()> {
        self.pool.warm_up()?;
        let conn = self.pool.acquire()?;
        match conn.version() {
            Ok(_) => Ok(()),
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let local = self.keys.tier_key(key, Tier::Memcached)?;
        let conn = self.pool.acquire()?;
        match conn.get::<Vec<u8>>(&local) {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Hit {
                    value,
                    remaining_ttl: None,
                }))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Memcached)?;
        let expiration = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
        let conn = self.pool.acquire()?;
        match conn.set(&local, value, expiration) {
            Ok(()) => {
                self.written.insert(key.to_string(), ());
                self.sets.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_secs = %ttl.as_secs(), "[memcached] cached key");
                Ok(())
            }
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Memcached)?;
        self.written.remove(key);
        let conn = self.pool.acquire()?;
        match conn.delete(&local) {
            // false just means the key was already gone.
            Ok(_) => Ok(()),
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn clear(&self) -> CacheResult<()> {
        let keys: Vec<String> = self.written.iter().map(|e| e.key().clone()).collect();
        let conn = self.pool.acquire()?;
        for key in &keys {
            let local = self.keys.tier_key(key, Tier::Memcached)?;
            if let Err(err) = conn.delete(&local) {
                return Err(Self::fail(conn, err));
            }
        }
        self.written.clear();
        debug!(count = keys.len(), "[memcached] cleared tracked keys");
        Ok(())
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: Some(self.written.len() as u64),
            bytes: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn reap_idle(&self) -> usize {
        self.pool.reap_idle()
    }

    fn close(&self) {
        self.written.clear();
        self.pool.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter(config: &NetworkConfig) -> MemcachedAdapter {
        let engine_config = EngineConfig::default();
        let scopes = Tier::ALL
            .into_iter()
            .map(|t| (t, engine_config.tier_scope(t)))
            .collect();
        let keys = Arc::new(KeyManager::new(
            &engine_config.keys,
            engine_config.namespace(),
            scopes,
        ));
        MemcachedAdapter::new(keys, config)
    }

    #[test]
    fn probe_fails_fast_against_dead_backend() {
        let mut config = NetworkConfig::memcached_defaults();
        config.port = 1;
        config.retry_attempts = 0;
        config.connect_timeout_seconds = 1;
        let memcached = adapter(&config);
        assert!(memcached.probe().is_err());
    }

    #[test]
    #[ignore = "requires a local memcached server"]
    fn round_trip_against_live_memcached() {
        let memcached = adapter(&NetworkConfig::memcached_defaults());
        memcached.probe().expect("probe");

        memcached
            .set("it:mc:rt", b"alice", Duration::from_secs(60))
            .expect("set");
        let hit = memcached.get("it:mc:rt").expect("get").expect("hit");
        assert_eq!(hit.value, b"alice");
        assert_eq!(hit.remaining_ttl, None);

        memcached.delete("it:mc:rt").expect("delete");
        assert!(memcached.get("it:mc:rt").expect("get").is_none());
    }
}

//! Redis network tier over pooled synchronous connections.
//!
//! TTL introspection uses `PTTL` so promotion can preserve remaining
//! lifetimes. `clear` walks the namespace with cursor-based `SCAN` and
//! deletes in batches; it never flushes the database. A connection that
//! reports an I/O failure is discarded back to the pool instead of being
//! parked idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use redis::{Client, Commands, Connection};
use tracing::{debug, info};

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::config::NetworkConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::pool::{ConnectionPool, Connector, PooledConn, PoolStats};
use crate::tier::Tier;

/// Opens Redis connections for the pool.
pub struct RedisConnector {
    client: Client,
    read_timeout: Duration,
}

impl Connector for RedisConnector {
    type Conn = Connection;

    fn backend(&self) -> &'static str {
        "redis"
    }

    fn connect(&self) -> CacheResult<Connection> {
        let conn = self.client.get_connection()?;
        conn.set_read_timeout(Some(self.read_timeout))?;
        conn.set_write_timeout(Some(self.read_timeout))?;
        Ok(conn)
    }

    fn ping(&self, conn: &mut Connection) -> bool {
        redis::cmd("PING").query::<String>(conn).is_ok()
    }
}

/// Redis tier.
pub struct RedisAdapter {
    keys: Arc<KeyManager>,
    pool: ConnectionPool<RedisConnector>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl RedisAdapter {
    /// Create the Redis tier. The URL is parsed eagerly; no connection is
    /// opened until the first probe or operation.
    ///
    /// # Errors
    ///
    /// When the connection URL assembled from the config does not parse.
    pub fn new(keys: Arc<KeyManager>, config: &NetworkConfig) -> CacheResult<Self> {
        let url = format!(
            "redis://{host}:{port}/{db}",
            host = config.host,
            port = config.port,
            db = config.database_index
        );
        let client = Client::open(url.as_str())?;
        info!(url = %url, "[redis] tier configured");
        let connector = RedisConnector {
            client,
            read_timeout: config.read_timeout(),
        };
        Ok(Self {
            keys,
            pool: ConnectionPool::new(connector, config),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        })
    }

    /// Pool occupancy for status reporting.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Map a command failure, discarding the lease when the connection is
    /// no longer trustworthy.
    fn fail(conn: PooledConn<'_, RedisConnector>, err: redis::RedisError) -> CacheError {
        let mapped: CacheError = err.into();
        if matches!(
            mapped,
            CacheError::ConnectionLost(_) | CacheError::ConnectionTimeout(_)
        ) {
            conn.discard();
        }
        mapped
    }

    fn scan_namespace(&self, conn: &mut Connection) -> Result<Vec<String>, redis::RedisError> {
        let pattern = format!("{}*", self.keys.namespace_prefix());
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query(conn)?;
            cursor = next;
            keys.extend(batch);
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

impl TierAdapter for RedisAdapter {
    fn tier(&self) -> Tier {
        Tier::Redis
    }

    fn probe(&self) -> CacheResult<()> {
        self.pool.warm_up()?;
        let mut conn = self.pool.acquire()?;
        match redis::cmd("PING").query::<String>(&mut *conn) {
            Ok(_) => Ok(()),
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let local = self.keys.tier_key(key, Tier::Redis)?;
        let mut conn = self.pool.acquire()?;

        let value: Option<Vec<u8>> = match conn.get(&local) {
            Ok(value) => value,
            Err(err) => return Err(Self::fail(conn, err)),
        };
        let Some(value) = value else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        // PTTL: -2 key vanished, -1 no expiry, otherwise milliseconds.
        let ttl_millis: i64 = match redis::cmd("PTTL").arg(&local).query(&mut *conn) {
            Ok(ttl) => ttl,
            Err(err) => return Err(Self::fail(conn, err)),
        };
        let remaining_ttl = u64::try_from(ttl_millis).ok().map(Duration::from_millis);

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Hit {
            value,
            remaining_ttl,
        }))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Redis)?;
        let mut conn = self.pool.acquire()?;
        let outcome = if ttl.is_zero() {
            conn.set::<_, _, ()>(&local, value)
        } else {
            conn.set_ex::<_, _, ()>(&local, value, ttl.as_secs().max(1))
        };
        match outcome {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_secs = %ttl.as_secs(), "[redis] cached key");
                Ok(())
            }
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Redis)?;
        let mut conn = self.pool.acquire()?;
        match conn.del::<_, ()>(&local) {
            Ok(()) => Ok(()),
            Err(err) => Err(Self::fail(conn, err)),
        }
    }

    fn clear(&self) -> CacheResult<()> {
        let mut conn = self.pool.acquire()?;
        let keys = match self.scan_namespace(&mut conn) {
            Ok(keys) => keys,
            Err(err) => return Err(Self::fail(conn, err)),
        };
        if keys.is_empty() {
            return Ok(());
        }
        for batch in keys.chunks(100) {
            if let Err(err) = conn.del::<_, ()>(batch) {
                return Err(Self::fail(conn, err));
            }
        }
        debug!(count = keys.len(), "[redis] cleared namespace keys");
        Ok(())
    }

    fn stats(&self) -> TierStats {
        let entries = self
            .pool
            .acquire()
            .ok()
            .and_then(|mut conn| self.scan_namespace(&mut conn).ok())
            .map(|keys| keys.len() as u64);
        TierStats {
            entries,
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
        self.pool.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter(config: &NetworkConfig) -> RedisAdapter {
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
        RedisAdapter::new(keys, config).expect("valid config")
    }

    #[test]
    fn construction_does_not_dial() {
        // Port 1 is never a live Redis; constructing must still succeed
        // because connections are opened lazily by the pool.
        let mut config = NetworkConfig::redis_defaults();
        config.port = 1;
        config.retry_attempts = 0;
        let redis = adapter(&config);
        assert_eq!(redis.pool_stats().leased, 0);
    }

    #[test]
    fn probe_fails_fast_against_dead_backend() {
        let mut config = NetworkConfig::redis_defaults();
        config.port = 1;
        config.retry_attempts = 0;
        config.connect_timeout_seconds = 1;
        let redis = adapter(&config);
        assert!(redis.probe().is_err());
    }

    #[test]
    #[ignore = "requires a local redis server"]
    fn round_trip_against_live_redis() {
        let redis = adapter(&NetworkConfig::redis_defaults());
        redis.probe().expect("probe");

        redis
            .set("it:redis:rt", b"alice", Duration::from_secs(60))
            .expect("set");
        let hit = redis.get("it:redis:rt").expect("get").expect("hit");
        assert_eq!(hit.value, b"alice");
        assert!(hit.remaining_ttl.is_some());

        redis.delete("it:redis:rt").expect("delete");
        assert!(redis.get("it:redis:rt").expect("get").is_none());
    }

    #[test]
    #[ignore = "requires a local redis server"]
    fn clear_removes_only_namespace_keys() {
        let redis = adapter(&NetworkConfig::redis_defaults());
        redis.probe().expect("probe");

        redis
            .set("it:redis:clear", b"v", Duration::from_secs(60))
            .expect("set");
        redis.clear().expect("clear");
        assert!(redis.get("it:redis:clear").expect("get").is_none());
    }
}

//! Lock-striped in-process tier.
//!
//! A fixed array of `RwLock<HashMap>` shards selected by key hash, so
//! writers on different keys rarely contend. Entries carry their own
//! deadline and are checked on read.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }

    fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Sharded in-process tier.
pub struct StripedAdapter {
    keys: Arc<KeyManager>,
    shards: Vec<RwLock<HashMap<String, CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl StripedAdapter {
    /// Create the striped tier.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self {
            keys,
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    #[allow(clippy::indexing_slicing)] // modulo keeps the index in range
    fn shard(&self, local_key: &str) -> &RwLock<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        local_key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }
}

impl TierAdapter for StripedAdapter {
    fn tier(&self) -> Tier {
        Tier::Striped
    }

    fn probe(&self) -> CacheResult<()> {
        let probe_key = self.keys.tier_key("probe:striped", Tier::Striped)?;
        let shard = self.shard(&probe_key);
        shard.write().insert(
            probe_key.clone(),
            CacheEntry::new(b"ok".to_vec(), Duration::from_secs(10)),
        );
        let round_trip = shard
            .read()
            .get(&probe_key)
            .is_some_and(|entry| entry.value == b"ok");
        shard.write().remove(&probe_key);
        if round_trip {
            Ok(())
        } else {
            Err(CacheError::backend("striped map probe round-trip failed"))
        }
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let local = self.keys.tier_key(key, Tier::Striped)?;
        let shard = self.shard(&local);

        let expired = {
            let guard = shard.read();
            match guard.get(&local) {
                Some(entry) if entry.is_expired() => true,
                Some(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(Hit {
                        value: entry.value.clone(),
                        remaining_ttl: entry.remaining(),
                    }));
                }
                None => false,
            }
        };

        if expired {
            shard.write().remove(&local);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Striped)?;
        self.shard(&local)
            .write()
            .insert(local, CacheEntry::new(value.to_vec(), ttl));
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[striped] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Striped)?;
        self.shard(&local).write().remove(&local);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        for shard in &self.shards {
            shard.write().clear();
        }
        Ok(())
    }

    fn stats(&self) -> TierStats {
        let entries: usize = self.shards.iter().map(|s| s.read().len()).sum();
        TierStats {
            entries: Some(entries as u64),
            bytes: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter() -> StripedAdapter {
        let config = EngineConfig::default();
        let scopes = Tier::ALL
            .into_iter()
            .map(|t| (t, config.tier_scope(t)))
            .collect();
        StripedAdapter::new(Arc::new(KeyManager::new(
            &config.keys,
            config.namespace(),
            scopes,
        )))
    }

    #[test]
    fn round_trip_across_many_keys() {
        let striped = adapter();
        for i in 0..100 {
            striped
                .set(&format!("k:{i}"), format!("v{i}").as_bytes(), Duration::from_secs(60))
                .expect("set");
        }
        for i in 0..100 {
            let hit = striped.get(&format!("k:{i}")).expect("get").expect("hit");
            assert_eq!(hit.value, format!("v{i}").as_bytes());
        }
        assert_eq!(striped.stats().entries, Some(100));
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let striped = Arc::new(adapter());
        std::thread::scope(|scope| {
            for t in 0..4 {
                let striped = Arc::clone(&striped);
                scope.spawn(move || {
                    for i in 0..50 {
                        striped
                            .set(&format!("t{t}:k{i}"), b"v", Duration::from_secs(60))
                            .expect("set");
                    }
                });
            }
        });
        assert_eq!(striped.stats().entries, Some(200));
    }

    #[test]
    fn clear_empties_every_shard() {
        let striped = adapter();
        for i in 0..32 {
            striped
                .set(&format!("k:{i}"), b"v", Duration::from_secs(60))
                .expect("set");
        }
        striped.clear().expect("clear");
        assert_eq!(striped.stats().entries, Some(0));
    }
}

//! Scratch tier: a bounded `quick_cache` store for short-lived hot data.
//!
//! Capacity-bounded with LRU-ish admission; entries carry their own
//! deadline and are checked on read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use quick_cache::sync::Cache;
use tracing::debug;

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug)]
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

/// Bounded scratch tier.
pub struct ScratchAdapter {
    keys: Arc<KeyManager>,
    cache: Cache<String, Arc<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl ScratchAdapter {
    /// Create the scratch tier with the default capacity.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self {
            keys,
            cache: Cache::new(DEFAULT_CAPACITY),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }
}

impl TierAdapter for ScratchAdapter {
    fn tier(&self) -> Tier {
        Tier::Scratch
    }

    fn probe(&self) -> CacheResult<()> {
        let probe_key = self.keys.tier_key("probe:scratch", Tier::Scratch)?;
        self.cache.insert(
            probe_key.clone(),
            Arc::new(CacheEntry::new(b"ok".to_vec(), Duration::from_secs(10))),
        );
        let round_trip = self
            .cache
            .get(&probe_key)
            .is_some_and(|entry| entry.value == b"ok");
        self.cache.remove(&probe_key);
        if round_trip {
            Ok(())
        } else {
            Err(CacheError::backend("scratch probe round-trip failed"))
        }
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let local = self.keys.tier_key(key, Tier::Scratch)?;
        match self.cache.get(&local) {
            Some(entry) if entry.is_expired() => {
                self.cache.remove(&local);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Hit {
                    value: entry.value.clone(),
                    remaining_ttl: entry.remaining(),
                }))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Scratch)?;
        self.cache
            .insert(local, Arc::new(CacheEntry::new(value.to_vec(), ttl)));
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[scratch] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Scratch)?;
        self.cache.remove(&local);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.cache.clear();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: Some(self.cache.len() as u64),
            bytes: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter() -> ScratchAdapter {
        let config = EngineConfig::default();
        let scopes = Tier::ALL
            .into_iter()
            .map(|t| (t, config.tier_scope(t)))
            .collect();
        ScratchAdapter::new(Arc::new(KeyManager::new(
            &config.keys,
            config.namespace(),
            scopes,
        )))
    }

    #[test]
    fn round_trip() {
        let scratch = adapter();
        scratch
            .set("user:1", b"alice", Duration::from_secs(60))
            .expect("set");
        let hit = scratch.get("user:1").expect("get").expect("hit");
        assert_eq!(hit.value, b"alice");
    }

    #[test]
    fn delete_is_idempotent() {
        let scratch = adapter();
        scratch.set("k", b"v", Duration::from_secs(60)).expect("set");
        scratch.delete("k").expect("delete");
        scratch.delete("k").expect("delete again");
        assert!(scratch.get("k").expect("get").is_none());
    }

    #[test]
    fn probe_passes() {
        assert!(adapter().probe().is_ok());
    }
}

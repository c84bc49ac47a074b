//! Fastest tier: Moka in-process cache with per-entry TTL.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::sync::Cache;
use tracing::debug;

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::config::MemoryConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

/// Cache entry with TTL information. Moka evicts by capacity; the exact
/// per-entry deadline lives here and is checked on read.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value: Arc::new(value),
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

/// Moka-backed in-process tier.
pub struct MemoryAdapter {
    keys: Arc<KeyManager>,
    cache: Cache<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl MemoryAdapter {
    /// Create the memory tier with the configured capacity.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, config: &MemoryConfig) -> Self {
        let cache = Cache::builder().max_capacity(config.max_capacity).build();
        Self {
            keys,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }
}

impl TierAdapter for MemoryAdapter {
    fn tier(&self) -> Tier {
        Tier::Memory
    }

    fn probe(&self) -> CacheResult<()> {
        let probe_key = self.keys.tier_key("probe:memory", Tier::Memory)?;
        self.cache.insert(
            probe_key.clone(),
            CacheEntry::new(b"ok".to_vec(), Duration::from_secs(10)),
        );
        let round_trip = self
            .cache
            .get(&probe_key)
            .is_some_and(|entry| *entry.value == b"ok");
        self.cache.invalidate(&probe_key);
        if round_trip {
            Ok(())
        } else {
            Err(CacheError::backend("memory probe round-trip failed"))
        }
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let local = self.keys.tier_key(key, Tier::Memory)?;
        match self.cache.get(&local) {
            Some(entry) if entry.is_expired() => {
                self.cache.invalidate(&local);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Hit {
                    value: entry.value.as_ref().clone(),
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
        let local = self.keys.tier_key(key, Tier::Memory)?;
        self.cache.insert(local, CacheEntry::new(value.to_vec(), ttl));
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[memory] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Memory)?;
        self.cache.invalidate(&local);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.cache.invalidate_all();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: Some(self.cache.entry_count()),
            bytes: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.cache.invalidate_all();
    }
}

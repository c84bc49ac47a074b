//! Shared-map tier: a `DashMap` visible to every thread in the process.
//!
//! Entries carry their own deadline and are checked on read, so the tier
//! counts as natively TTL'd and is not part of the expiration sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

/// Cache entry with expiration tracking.
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

/// Concurrent shared-map tier.
pub struct SharedAdapter {
    keys: Arc<KeyManager>,
    map: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl SharedAdapter {
    /// Create the shared-map tier.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self {
            keys,
            map: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }
}

impl TierAdapter for SharedAdapter {
    fn tier(&self) -> Tier {
        Tier::Shared
    }

    fn probe(&self) -> CacheResult<()> {
        let probe_key = self.keys.tier_key("probe:shared", Tier::Shared)?;
        self.map.insert(
            probe_key.clone(),
            CacheEntry::new(b"ok".to_vec(), Duration::from_secs(10)),
        );
        let round_trip = self
            .map
            .get(&probe_key)
            .is_some_and(|entry| entry.value == b"ok");
        self.map.remove(&probe_key);
        if round_trip {
            Ok(())
        } else {
            Err(CacheError::backend("shared map probe round-trip failed"))
        }
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let local = self.keys.tier_key(key, Tier::Shared)?;
        if let Some(entry) = self.map.get(&local) {
            if entry.is_expired() {
                drop(entry); // Release the shard guard before removing.
                self.map.remove(&local);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Hit {
                    value: entry.value.clone(),
                    remaining_ttl: entry.remaining(),
                }))
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Shared)?;
        self.map.insert(local, CacheEntry::new(value.to_vec(), ttl));
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[shared] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let local = self.keys.tier_key(key, Tier::Shared)?;
        self.map.remove(&local);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.map.clear();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: Some(self.map.len() as u64),
            bytes: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter() -> SharedAdapter {
        let config = EngineConfig::default();
        let scopes = Tier::ALL
            .into_iter()
            .map(|t| (t, config.tier_scope(t)))
            .collect();
        SharedAdapter::new(Arc::new(KeyManager::new(
            &config.keys,
            config.namespace(),
            scopes,
        )))
    }

    #[test]
    fn round_trip_and_delete() {
        let shared = adapter();
        shared
            .set("user:1", b"alice", Duration::from_secs(60))
            .expect("set");
        let hit = shared.get("user:1").expect("get").expect("hit");
        assert_eq!(hit.value, b"alice");
        assert!(hit.remaining_ttl.is_some());

        shared.delete("user:1").expect("delete");
        assert!(shared.get("user:1").expect("get").is_none());
        // Deleting a missing key is fine.
        shared.delete("user:1").expect("delete again");
    }

    #[test]
    fn zero_ttl_never_expires() {
        let shared = adapter();
        shared.set("pin", b"v", Duration::ZERO).expect("set");
        let hit = shared.get("pin").expect("get").expect("hit");
        assert_eq!(hit.remaining_ttl, None);
    }

    #[test]
    fn expired_entry_reads_as_miss_and_is_removed() {
        let shared = adapter();
        shared.set("gone", b"v", Duration::from_secs(60)).expect("set");
        // Force the entry stale in place.
        let local = shared.keys.tier_key("gone", Tier::Shared).expect("key");
        if let Some(mut entry) = shared.map.get_mut(&local) {
            entry.expires_at = Some(Instant::now() - Duration::from_secs(1));
        }
        assert!(shared.get("gone").expect("get").is_none());
        assert!(!shared.map.contains_key(&local));
    }

    #[test]
    fn probe_leaves_no_residue() {
        let shared = adapter();
        shared.probe().expect("probe");
        assert_eq!(shared.map.len(), 0);
    }
}

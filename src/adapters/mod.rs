//! Tier adapters.
//!
//! One adapter variant per backend kind, all speaking the same
//! [`TierAdapter`] contract. Adapters own their substrate handles (maps,
//! pools, directories) and derive tier-local keys through the shared
//! [`crate::keys::KeyManager`]; the dispatcher never sees a backend API.
//!
//! # Available adapters
//!
//! ## In-process
//! - [`memory::MemoryAdapter`] — Moka cache with per-entry TTL (feature: `moka`)
//! - [`striped::StripedAdapter`] — lock-striped map, sharded by key hash
//! - [`shared::SharedAdapter`] — `DashMap` shared across threads
//! - [`scratch::ScratchAdapter`] — bounded `quick_cache` store (feature: `quick_cache`)
//!
//! ## Shared-memory / mapped
//! - [`shm::ShmAdapter`] — one segment file per entry, numeric ids
//! - [`mmap::MmapAdapter`] — fixed-size memory-mapped entry files
//!
//! ## Network
//! - [`redis::RedisAdapter`] — pooled Redis connections (feature: `redis`)
//! - [`memcached::MemcachedAdapter`] — pooled Memcached clients (feature: `memcached`)
//!
//! ## On-disk
//! - [`file::FileAdapter`] — expiry-prefixed cache files

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{CacheError, CacheResult};
use crate::tier::Tier;

pub mod file;
pub mod mmap;
pub mod shared;
pub mod shm;
pub mod striped;

#[cfg(feature = "moka")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "backend-memcached")]
pub mod memcached;

#[cfg(feature = "backend-quickcache")]
pub mod scratch;

pub use file::FileAdapter;
pub use mmap::MmapAdapter;
pub use shared::SharedAdapter;
pub use shm::ShmAdapter;
pub use striped::StripedAdapter;

#[cfg(feature = "moka")]
pub use memory::MemoryAdapter;

#[cfg(feature = "redis")]
pub use redis::RedisAdapter;

#[cfg(feature = "backend-memcached")]
pub use memcached::MemcachedAdapter;

#[cfg(feature = "backend-quickcache")]
pub use scratch::ScratchAdapter;

/// A value found in a tier, with the remaining TTL when the backend can
/// report it. The dispatcher uses the remaining TTL to bound promotion.
#[derive(Debug, Clone)]
pub struct Hit {
    /// The stored payload.
    pub value: Vec<u8>,
    /// Remaining time to live; `None` when the entry never expires or the
    /// backend cannot introspect it.
    pub remaining_ttl: Option<Duration>,
}

/// Cheap per-tier statistics snapshot. Fields are `None` when the backend
/// cannot report them cheaply.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TierStats {
    /// Entries currently owned by this adapter.
    pub entries: Option<u64>,
    /// Bytes currently owned by this adapter.
    pub bytes: Option<u64>,
    /// Reads that found a live entry.
    pub hits: u64,
    /// Reads that found nothing (or an expired entry).
    pub misses: u64,
    /// Completed writes.
    pub sets: u64,
}

/// Raw get/set/delete/clear against one substrate.
///
/// Implementations never panic across this boundary; every failure becomes
/// a [`CacheError`]. Deleting a missing key is `Ok`. `clear` removes only
/// entries bearing this engine's namespace, never sibling data on shared
/// substrates.
pub trait TierAdapter: Send + Sync {
    /// Which tier this adapter serves.
    fn tier(&self) -> Tier;

    /// Cheap availability check: a tiny round-trip or a directory write
    /// test. Called at discovery and periodically by the health monitor.
    ///
    /// # Errors
    ///
    /// Any error means the tier is unavailable right now.
    fn probe(&self) -> CacheResult<()>;

    /// Look up a caller key. Expired entries are deleted and reported as
    /// `None`.
    ///
    /// # Errors
    ///
    /// Backend failures; never "not found".
    fn get(&self, key: &str) -> CacheResult<Option<Hit>>;

    /// Store a value, overwriting any previous entry. A zero `ttl` means
    /// the entry never expires.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Delete a caller key. Missing keys are `Ok`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remove every entry this adapter owns (namespace-scoped on shared
    /// substrates).
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn clear(&self) -> CacheResult<()>;

    /// Cheap statistics snapshot.
    fn stats(&self) -> TierStats;

    /// Remove entries whose stored `expires_at` has passed. Only
    /// meaningful for tiers without native TTL; the default is a no-op.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn sweep_expired(&self) -> CacheResult<u64> {
        Ok(0)
    }

    /// Close pooled connections idle past their age limit. Only meaningful
    /// for network tiers; the default is a no-op. Returns how many were
    /// closed.
    fn reap_idle(&self) -> usize {
        0
    }

    /// Swap the adapter's base directory. Only the file-backed tiers
    /// implement this; entries under the old path are abandoned.
    ///
    /// # Errors
    ///
    /// When the new directory cannot be created or written.
    fn set_base_path(&self, _path: &Path) -> CacheResult<()> {
        Ok(())
    }

    /// Release substrate handles. Stored data outlives `close` on
    /// persistent substrates; in-engine indices are dropped.
    fn close(&self) {}
}

/// Width of the decimal `expires_at` prefix on TTL-less substrates.
pub(crate) const EXPIRY_PREFIX_LEN: usize = 10;

/// Current wall clock in whole seconds since the epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Absolute expiry for `ttl`; zero means "never expires".
pub(crate) fn expires_at(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        0
    } else {
        unix_now().saturating_add(ttl.as_secs().max(1))
    }
}

/// Whether a stored expiry stamp has passed.
pub(crate) fn is_stale(expiry: u64) -> bool {
    expiry != 0 && expiry <= unix_now()
}

/// Remaining TTL for a stored expiry stamp, `None` when it never expires.
pub(crate) fn remaining_ttl(expiry: u64) -> Option<Duration> {
    if expiry == 0 {
        None
    } else {
        Some(Duration::from_secs(expiry.saturating_sub(unix_now())))
    }
}

/// Encode a stored record: fixed-width decimal `expires_at` followed by the
/// payload bytes.
pub(crate) fn encode_record(expiry: u64, payload: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(EXPIRY_PREFIX_LEN + payload.len());
    blob.extend_from_slice(format!("{expiry:010}").as_bytes());
    blob.extend_from_slice(payload);
    blob
}

/// Decode a stored record into `(expires_at, payload)`.
pub(crate) fn decode_record(blob: &[u8]) -> CacheResult<(u64, &[u8])> {
    let (prefix, payload) = blob
        .split_at_checked(EXPIRY_PREFIX_LEN)
        .ok_or_else(|| CacheError::Serialization("record shorter than expiry prefix".into()))?;
    let prefix = std::str::from_utf8(prefix)
        .map_err(|_| CacheError::Serialization("expiry prefix is not ASCII".into()))?;
    let expiry: u64 = prefix
        .parse()
        .map_err(|_| CacheError::Serialization("expiry prefix is not decimal".into()))?;
    Ok((expiry, payload))
}

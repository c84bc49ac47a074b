//! The cache engine: public API and hierarchical dispatch.
//!
//! Reads descend the available tiers in priority order and promote hits
//! toward faster tiers; writes fan out across every usable tier and succeed
//! if any tier accepted; `delete`/`clear` are strict and fail when any tier
//! reports a real error. Adapter failures never propagate as panics — the
//! dispatcher absorbs them, records the most recent one for
//! [`CacheEngine::get_last_error`], and feeds the health monitor.
//!
//! Lifecycle: the engine is built cold; the first public call runs
//! discovery (probing every adapter and warming network pools). `close`
//! drains pools and releases handles, and the next call after `close`
//! re-initializes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapters::{Hit, TierAdapter, TierStats};
use crate::config::EngineConfig;
use crate::error::{CacheError, CacheResult};
use crate::health::{HealthMonitor, HealthVerdict, MonitoringStats};
use crate::keys::KeyManager;
use crate::registry::{TierRegistry, TierState};
use crate::tier::{Tier, TierKind};

/// Default upper bound on the TTL used when promoting a hit to faster
/// tiers. The actual promotion TTL is the smaller of this and the
/// remaining TTL reported by the hit tier.
pub const PROMOTION_TTL: Duration = Duration::from_secs(3600);

/// Engine lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    /// Built, discovery not yet run.
    Uninitialized,
    /// Discovery complete; serving requests.
    Ready,
    /// Closed; the next public call re-initializes.
    Closed,
}

/// Status snapshot for one tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    /// The tier.
    pub tier: Tier,
    /// Fixed priority, smaller = faster.
    pub priority: u8,
    /// Substrate classification.
    pub kind: TierKind,
    /// Lifecycle state as the dispatcher sees it.
    pub state: TierState,
    /// Passed the discovery probe.
    pub available: bool,
    /// Currently routed to (available and not demoted).
    pub healthy: bool,
    /// Most recent monitor verdict, when one exists.
    pub verdict: Option<HealthVerdict>,
    /// Consecutive failures recorded by the monitor.
    pub consecutive_failures: u32,
    /// Most recent failure cause.
    pub last_cause: Option<String>,
    /// Adapter counters.
    pub stats: TierStats,
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// `get` calls served.
    pub gets: u64,
    /// `get` calls that returned a value.
    pub hits: u64,
    /// `get` calls that returned nothing.
    pub misses: u64,
    /// `set` calls accepted by at least one tier.
    pub sets: u64,
    /// `delete` calls served.
    pub deletes: u64,
    /// Values copied up to faster tiers on the read path.
    pub promotions: u64,
    /// Hits per get, in percent.
    pub hit_rate: f64,
    /// Tier that served the most recent hit or accepted the most recent
    /// write.
    pub last_used_tier: Option<Tier>,
}

/// Outcome summary of a multi-tier operation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatchSummary {
    /// Tiers addressed.
    pub total: usize,
    /// Tiers that succeeded.
    pub successful: usize,
    /// Tiers that failed.
    pub failed: usize,
}

/// Per-tier results of `set_to_tiers` / `delete_from_tiers`.
#[derive(Debug, Clone)]
pub struct TierBatchReport {
    /// Result per addressed tier.
    pub results: BTreeMap<Tier, Result<(), CacheError>>,
    /// Aggregate counts.
    pub summary: BatchSummary,
}

impl TierBatchReport {
    fn from_results(results: BTreeMap<Tier, Result<(), CacheError>>) -> Self {
        let total = results.len();
        let successful = results.values().filter(|r| r.is_ok()).count();
        Self {
            results,
            summary: BatchSummary {
                total,
                successful,
                failed: total - successful,
            },
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    keys: Arc<KeyManager>,
    /// Adapters for the configured tiers, priority order. Tiers whose
    /// backend support is compiled out simply have no adapter here.
    adapters: Vec<(Tier, Box<dyn TierAdapter>)>,
    registry: TierRegistry,
    health: HealthMonitor,
    phase: RwLock<EnginePhase>,
    cache_path: RwLock<Option<PathBuf>>,
    last_used_tier: Mutex<Option<Tier>>,
    last_error: Mutex<Option<String>>,
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    promotions: AtomicU64,
}

/// Multi-tier cache engine handle. Cloning is cheap and every clone shares
/// the same tiers, pools, and state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl CacheEngine {
    /// Build an engine from its configuration. No backend is contacted
    /// here; discovery runs on the first public call.
    ///
    /// # Errors
    ///
    /// When a backend section is malformed (e.g. an unparsable Redis
    /// address).
    pub fn new(config: EngineConfig) -> CacheResult<Self> {
        let scopes: Vec<(Tier, String)> = Tier::ALL
            .into_iter()
            .map(|t| (t, config.tier_scope(t)))
            .collect();
        let keys = Arc::new(KeyManager::new(&config.keys, config.namespace(), scopes));

        let registry = TierRegistry::new(config.tiers.clone());
        let mut adapters: Vec<(Tier, Box<dyn TierAdapter>)> = Vec::new();
        for tier in registry.valid_tiers() {
            if let Some(adapter) = build_adapter(*tier, &config, &keys)? {
                adapters.push((*tier, adapter));
            }
        }
        info!(
            tiers = adapters.len(),
            namespace = %keys.namespace(),
            "cache engine built"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                health: HealthMonitor::new(config.health.clone()),
                cache_path: RwLock::new(config.path.clone()),
                keys,
                registry,
                adapters,
                config,
                phase: RwLock::new(EnginePhase::Uninitialized),
                last_used_tier: Mutex::new(None),
                last_error: Mutex::new(None),
                gets: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                sets: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
                promotions: AtomicU64::new(0),
            }),
        })
    }

    /// Engine built from the default configuration (all tiers, local
    /// backends).
    ///
    /// # Errors
    ///
    /// See [`CacheEngine::new`].
    pub fn with_defaults() -> CacheResult<Self> {
        Self::new(EngineConfig::default())
    }

    // ===== Hierarchical operations =====

    /// Look up `key`, scanning the available tiers in priority order. A hit
    /// is promoted to every faster usable tier; promotion failures are
    /// logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Only `InvalidKey`. Tier failures are absorbed and the scan
    /// continues; "every tier errored" is indistinguishable from a miss.
    pub fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.validate_key(key)?;
        self.ensure_ready();
        self.inner.gets.fetch_add(1, Ordering::Relaxed);

        let tiers = self.inner.registry.available_tiers();
        for tier in &tiers {
            if !self.inner.health.is_usable(*tier) {
                continue;
            }
            let Some(adapter) = self.adapter(*tier) else {
                continue;
            };
            match adapter.get(key) {
                Ok(Some(hit)) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    self.note_success(*tier);
                    *self.inner.last_used_tier.lock() = Some(*tier);
                    debug!(key = %key, tier = %tier, "cache hit");
                    self.promote(key, *tier, &hit, &tiers);
                    return Ok(Some(hit.value));
                }
                Ok(None) => {}
                Err(err) => self.note_failure(*tier, &err),
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "cache miss");
        Ok(None)
    }

    /// Write `value` through every usable tier. Succeeds when at least one
    /// tier accepted the write; the last-used tier becomes the fastest
    /// tier that accepted it.
    ///
    /// # Errors
    ///
    /// Only `InvalidKey`. An empty value returns `Ok(false)` with
    /// `EmptyValue` recorded as the last error.
    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.validate_key(key)?;
        if value.is_empty() {
            self.record_error(&CacheError::EmptyValue);
            return Ok(false);
        }
        self.ensure_ready();
        self.inner.sets.fetch_add(1, Ordering::Relaxed);

        let mut first_success: Option<Tier> = None;
        let mut successes = 0usize;
        for tier in self.usable_tiers() {
            let Some(adapter) = self.adapter(tier) else {
                continue;
            };
            match adapter.set(key, value, ttl) {
                Ok(()) => {
                    successes += 1;
                    first_success.get_or_insert(tier);
                    self.note_success(tier);
                }
                Err(err) => self.note_failure(tier, &err),
            }
        }

        if let Some(tier) = first_success {
            *self.inner.last_used_tier.lock() = Some(tier);
        }
        debug!(key = %key, successes, "write-through complete");
        Ok(successes > 0)
    }

    /// Delete `key` from every usable tier. Strict: returns `false` when
    /// any tier reported a real error ("no such key" is success).
    ///
    /// # Errors
    ///
    /// Only `InvalidKey`.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;
        self.ensure_ready();
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);

        let mut all_ok = true;
        for tier in self.usable_tiers() {
            let Some(adapter) = self.adapter(tier) else {
                continue;
            };
            match adapter.delete(key) {
                Ok(()) => self.note_success(tier),
                Err(err) => {
                    self.note_failure(tier, &err);
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    /// Clear every usable tier, touching only entries under this engine's
    /// namespace on shared substrates. Strict like [`CacheEngine::delete`].
    ///
    /// # Errors
    ///
    /// None; failures are reflected in the returned flag.
    pub fn clear(&self) -> CacheResult<bool> {
        self.ensure_ready();
        let mut all_ok = true;
        for tier in self.usable_tiers() {
            let Some(adapter) = self.adapter(tier) else {
                continue;
            };
            match adapter.clear() {
                Ok(()) => self.note_success(tier),
                Err(err) => {
                    self.note_failure(tier, &err);
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    /// Hierarchical get, computing and write-through caching the value on a
    /// miss.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, or whatever `compute` returns. Caching failures after
    /// a successful compute are logged, not surfaced.
    pub fn get_or_set<F>(&self, key: &str, ttl: Duration, compute: F) -> CacheResult<Vec<u8>>
    where
        F: FnOnce() -> CacheResult<Vec<u8>>,
    {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = compute()?;
        if !self.set(key, &value, ttl)? {
            warn!(key = %key, "computed value could not be cached in any tier");
        }
        Ok(value)
    }

    // ===== Tier-scoped operations =====

    /// Look up `key` in exactly one tier. No promotion.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, `InvalidTier`, `TierUnavailable`, `TierUnhealthy`, or
    /// the adapter's failure.
    pub fn get_from_tier(&self, key: &str, tier: Tier) -> CacheResult<Option<Vec<u8>>> {
        self.validate_key(key)?;
        self.ensure_ready();
        let adapter = self.checked_adapter(tier)?;
        match adapter.get(key) {
            Ok(hit) => Ok(hit.map(|h| h.value)),
            Err(err) => {
                self.note_failure(tier, &err);
                Err(err)
            }
        }
    }

    /// Write `key` to exactly one tier.
    ///
    /// # Errors
    ///
    /// Same kinds as [`CacheEngine::get_from_tier`].
    pub fn set_to_tier(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tier: Tier,
    ) -> CacheResult<bool> {
        self.validate_key(key)?;
        if value.is_empty() {
            self.record_error(&CacheError::EmptyValue);
            return Ok(false);
        }
        self.ensure_ready();
        let adapter = self.checked_adapter(tier)?;
        match adapter.set(key, value, ttl) {
            Ok(()) => {
                self.note_success(tier);
                *self.inner.last_used_tier.lock() = Some(tier);
                Ok(true)
            }
            Err(err) => {
                self.note_failure(tier, &err);
                Err(err)
            }
        }
    }

    /// Delete `key` from exactly one tier.
    ///
    /// # Errors
    ///
    /// Same kinds as [`CacheEngine::get_from_tier`].
    pub fn delete_from_tier(&self, key: &str, tier: Tier) -> CacheResult<bool> {
        self.validate_key(key)?;
        self.ensure_ready();
        let adapter = self.checked_adapter(tier)?;
        match adapter.delete(key) {
            Ok(()) => {
                self.note_success(tier);
                Ok(true)
            }
            Err(err) => {
                self.note_failure(tier, &err);
                Err(err)
            }
        }
    }

    /// Write `key` to an explicit subset of tiers, reporting per-tier
    /// outcomes.
    ///
    /// # Errors
    ///
    /// `InvalidKey` only; per-tier failures live in the report.
    pub fn set_to_tiers(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tiers: &[Tier],
    ) -> CacheResult<TierBatchReport> {
        self.validate_key(key)?;
        self.ensure_ready();
        let mut results = BTreeMap::new();
        for tier in tiers {
            let outcome = if value.is_empty() {
                Err(CacheError::EmptyValue)
            } else {
                self.tier_op(*tier, |adapter| adapter.set(key, value, ttl))
            };
            results.insert(*tier, outcome);
        }
        Ok(TierBatchReport::from_results(results))
    }

    /// Delete `key` from an explicit subset of tiers, reporting per-tier
    /// outcomes.
    ///
    /// # Errors
    ///
    /// `InvalidKey` only; per-tier failures live in the report.
    pub fn delete_from_tiers(&self, key: &str, tiers: &[Tier]) -> CacheResult<TierBatchReport> {
        self.validate_key(key)?;
        self.ensure_ready();
        let mut results = BTreeMap::new();
        for tier in tiers {
            results.insert(*tier, self.tier_op(*tier, |adapter| adapter.delete(key)));
        }
        Ok(TierBatchReport::from_results(results))
    }

    /// Try `preferred` first; on a miss (or a tier error) with `fallback`
    /// enabled, degenerate to the ordinary hierarchical [`CacheEngine::get`].
    ///
    /// # Errors
    ///
    /// With `fallback` disabled, the preferred tier's error kinds surface;
    /// with it enabled, only `InvalidKey`.
    pub fn get_with_tier_preference(
        &self,
        key: &str,
        preferred: Tier,
        fallback: bool,
    ) -> CacheResult<Option<Vec<u8>>> {
        match self.get_from_tier(key, preferred) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) if fallback => self.get(key),
            Ok(None) => Ok(None),
            Err(CacheError::InvalidKey(err)) => Err(CacheError::InvalidKey(err)),
            Err(err) if fallback => {
                warn!(tier = %preferred, error = %err, "preferred tier failed, falling back");
                self.get(key)
            }
            Err(err) => Err(err),
        }
    }

    // ===== Expiration sweep =====

    /// Remove expired entries from every available tier whose substrate
    /// lacks native TTL (shared-memory, mapped files, on-disk files).
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// None; per-tier sweep failures are recorded and skipped.
    pub fn cleanup_expired(&self) -> CacheResult<u64> {
        self.ensure_ready();
        let mut removed = 0;
        for (tier, adapter) in &self.inner.adapters {
            if tier.supports_native_ttl() || !self.inner.registry.is_available(*tier) {
                continue;
            }
            match adapter.sweep_expired() {
                Ok(count) => removed += count,
                Err(err) => self.note_failure(*tier, &err),
            }
        }
        if removed > 0 {
            info!(removed, "expiration sweep complete");
        }
        Ok(removed)
    }

    /// Alias for [`CacheEngine::cleanup_expired`].
    ///
    /// # Errors
    ///
    /// See [`CacheEngine::cleanup_expired`].
    pub fn cleanup(&self) -> CacheResult<u64> {
        self.cleanup_expired()
    }

    /// Close pooled network connections idle past their age limit.
    /// Returns how many were closed. Intended for a periodic maintenance
    /// tick alongside [`CacheEngine::cleanup_expired`].
    pub fn reap_idle_connections(&self) -> usize {
        self.inner
            .adapters
            .iter()
            .map(|(_, adapter)| adapter.reap_idle())
            .sum()
    }

    // ===== Tier introspection =====

    /// Whether `tier` belongs to this engine's configured set.
    #[must_use]
    pub fn is_tier_valid(&self, tier: Tier) -> bool {
        self.inner.registry.is_valid(tier)
    }

    /// Whether `tier` passed its discovery probe.
    #[must_use]
    pub fn is_tier_available(&self, tier: Tier) -> bool {
        self.ensure_ready();
        self.inner.registry.is_available(tier)
    }

    /// Whether the dispatcher currently routes to `tier`.
    #[must_use]
    pub fn is_tier_healthy(&self, tier: Tier) -> bool {
        self.ensure_ready();
        self.inner.registry.is_available(tier) && self.inner.health.is_usable(tier)
    }

    /// Available tiers, strictly sorted by priority.
    #[must_use]
    pub fn get_available_tiers(&self) -> Vec<Tier> {
        self.ensure_ready();
        self.inner.registry.available_tiers()
    }

    /// Whether at least one tier can serve requests.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.ensure_ready();
        self.inner
            .registry
            .available_tiers()
            .iter()
            .any(|t| self.inner.health.is_usable(*t))
    }

    /// Status snapshot for every configured tier.
    #[must_use]
    pub fn get_tier_status(&self) -> Vec<TierStatus> {
        self.ensure_ready();
        self.inner
            .registry
            .valid_tiers()
            .iter()
            .map(|tier| {
                let available = self.inner.registry.is_available(*tier);
                TierStatus {
                    tier: *tier,
                    priority: tier.priority(),
                    kind: tier.kind(),
                    state: self.inner.registry.state(*tier),
                    available,
                    healthy: available && self.inner.health.is_usable(*tier),
                    verdict: self.inner.health.verdict(*tier),
                    consecutive_failures: self.inner.health.consecutive_failures(*tier),
                    last_cause: self.inner.health.last_cause(*tier),
                    stats: self
                        .adapter(*tier)
                        .map(TierAdapter::stats)
                        .unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Force a health verdict for one tier.
    ///
    /// # Errors
    ///
    /// `InvalidTier` when the tier is not configured, `TierUnavailable`
    /// when its backend support is compiled out.
    pub fn check_tier(&self, tier: Tier) -> CacheResult<HealthVerdict> {
        self.ensure_ready();
        if !self.inner.registry.is_valid(tier) {
            return Err(CacheError::InvalidTier(tier.to_string()));
        }
        let Some(adapter) = self.adapter(tier) else {
            return Err(CacheError::TierUnavailable(tier));
        };
        let verdict = self.inner.health.check(tier, adapter);
        self.apply_verdict(tier, verdict);
        Ok(verdict)
    }

    /// Health verdicts for every configured tier.
    #[must_use]
    pub fn check_all_tiers(&self) -> Vec<(Tier, HealthVerdict)> {
        self.ensure_ready();
        let verdicts = self.inner.health.check_all(
            self.inner
                .adapters
                .iter()
                .map(|(tier, adapter)| (*tier, adapter.as_ref())),
        );
        for (tier, verdict) in &verdicts {
            self.apply_verdict(*tier, *verdict);
        }
        verdicts
    }

    /// Aggregate monitor counters.
    #[must_use]
    pub fn get_monitoring_stats(&self) -> MonitoringStats {
        self.inner.health.monitoring_stats()
    }

    // ===== Paths, stats, lifecycle =====

    /// Swap the cache directory used by the on-disk and mapped-file tiers.
    /// Entries under the old path are abandoned, not migrated. Returns
    /// whether every file-backed tier accepted the new path.
    ///
    /// # Errors
    ///
    /// None; failures are reflected in the returned flag and tier
    /// availability.
    pub fn set_cache_path(&self, path: &Path) -> CacheResult<bool> {
        self.ensure_ready();
        let mut all_ok = true;
        for (tier, adapter) in &self.inner.adapters {
            if !matches!(tier, Tier::File | Tier::Mmap) {
                continue;
            }
            match adapter.set_base_path(path) {
                Ok(()) => self.inner.registry.record_reprobe(*tier, &adapter.probe()),
                Err(err) => {
                    self.note_failure(*tier, &err);
                    self.inner.registry.record_reprobe(*tier, &Err(err));
                    all_ok = false;
                }
            }
        }
        if all_ok {
            *self.inner.cache_path.write() = Some(path.to_path_buf());
        }
        Ok(all_ok)
    }

    /// The configured cache directory, when one is set.
    #[must_use]
    pub fn get_cache_path(&self) -> Option<PathBuf> {
        self.inner.cache_path.read().clone()
    }

    /// Aggregate counters.
    #[must_use]
    pub fn get_stats(&self) -> EngineStats {
        let gets = self.inner.gets.load(Ordering::Relaxed);
        let hits = self.inner.hits.load(Ordering::Relaxed);
        EngineStats {
            gets,
            hits,
            misses: self.inner.misses.load(Ordering::Relaxed),
            sets: self.inner.sets.load(Ordering::Relaxed),
            deletes: self.inner.deletes.load(Ordering::Relaxed),
            promotions: self.inner.promotions.load(Ordering::Relaxed),
            #[allow(clippy::cast_precision_loss)]
            hit_rate: if gets > 0 {
                (hits as f64 / gets as f64) * 100.0
            } else {
                0.0
            },
            last_used_tier: *self.inner.last_used_tier.lock(),
        }
    }

    /// Tier that served the most recent hit or accepted the most recent
    /// write.
    #[must_use]
    pub fn get_last_used_tier(&self) -> Option<Tier> {
        *self.inner.last_used_tier.lock()
    }

    /// Most recent adapter error, rendered as a string.
    #[must_use]
    pub fn get_last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Full diagnostic snapshot as JSON.
    #[must_use]
    pub fn debug(&self) -> serde_json::Value {
        serde_json::json!({
            "phase": *self.inner.phase.read(),
            "namespace": self.inner.keys.namespace(),
            "cache_path": self.get_cache_path(),
            "stats": self.get_stats(),
            "monitoring": self.get_monitoring_stats(),
            "tiers": self.get_tier_status(),
            "last_error": self.get_last_error(),
        })
    }

    /// Engine configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> EnginePhase {
        *self.inner.phase.read()
    }

    /// Drain pools, release substrate handles, and forget health state.
    /// Stored data on persistent substrates survives. The next public call
    /// re-initializes the engine.
    pub fn close(&self) {
        let mut phase = self.inner.phase.write();
        for (tier, adapter) in &self.inner.adapters {
            adapter.close();
            debug!(tier = %tier, "tier closed");
        }
        self.inner.registry.mark_closed();
        self.inner.health.reset();
        *self.inner.last_used_tier.lock() = None;
        *phase = EnginePhase::Closed;
        info!("cache engine closed");
    }

    // ===== Internals =====

    fn ensure_ready(&self) {
        if *self.inner.phase.read() == EnginePhase::Ready {
            return;
        }
        let mut phase = self.inner.phase.write();
        if *phase == EnginePhase::Ready {
            return;
        }
        let outcomes: Vec<(Tier, CacheResult<()>)> = self
            .inner
            .adapters
            .iter()
            .map(|(tier, adapter)| (*tier, adapter.probe()))
            .collect();
        self.inner
            .registry
            .record_discovery(outcomes.iter().map(|(tier, outcome)| (*tier, outcome)));
        self.inner.health.reset();
        *phase = EnginePhase::Ready;
    }

    fn validate_key(&self, key: &str) -> CacheResult<()> {
        if key.is_empty() {
            let err = CacheError::InvalidKey("empty key".to_string());
            self.record_error(&err);
            return Err(err);
        }
        Ok(())
    }

    fn adapter(&self, tier: Tier) -> Option<&dyn TierAdapter> {
        self.inner
            .adapters
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, adapter)| adapter.as_ref())
    }

    /// Validate a tier-scoped target: configured, then available, then
    /// healthy.
    fn checked_adapter(&self, tier: Tier) -> CacheResult<&dyn TierAdapter> {
        if !self.inner.registry.is_valid(tier) {
            return Err(CacheError::InvalidTier(tier.to_string()));
        }
        let Some(adapter) = self.adapter(tier) else {
            return Err(CacheError::TierUnavailable(tier));
        };
        if !self.inner.registry.is_available(tier) {
            return Err(CacheError::TierUnavailable(tier));
        }
        if !self.inner.health.is_usable(tier) {
            return Err(CacheError::TierUnhealthy(tier));
        }
        Ok(adapter)
    }

    fn tier_op<F>(&self, tier: Tier, op: F) -> Result<(), CacheError>
    where
        F: FnOnce(&dyn TierAdapter) -> CacheResult<()>,
    {
        let adapter = self.checked_adapter(tier)?;
        match op(adapter) {
            Ok(()) => {
                self.note_success(tier);
                Ok(())
            }
            Err(err) => {
                self.note_failure(tier, &err);
                Err(err)
            }
        }
    }

    fn usable_tiers(&self) -> Vec<Tier> {
        self.inner
            .registry
            .available_tiers()
            .into_iter()
            .filter(|tier| self.inner.health.is_usable(*tier))
            .collect()
    }

    /// Copy a hit up to every faster usable tier, bounding the TTL by the
    /// remaining lifetime at the hit tier.
    fn promote(&self, key: &str, hit_tier: Tier, hit: &Hit, tiers: &[Tier]) {
        let ttl = match hit.remaining_ttl {
            Some(remaining) if !remaining.is_zero() => PROMOTION_TTL.min(remaining),
            _ => PROMOTION_TTL,
        };
        let mut candidates: Vec<&Tier> = tiers
            .iter()
            .take_while(|t| t.priority() < hit_tier.priority())
            .collect();
        candidates.reverse();
        for tier in candidates {
            if !self.inner.health.is_usable(*tier) {
                continue;
            }
            let Some(adapter) = self.adapter(*tier) else {
                continue;
            };
            match adapter.set(key, &hit.value, ttl) {
                Ok(()) => {
                    self.inner.promotions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, from = %hit_tier, to = %tier, ttl_secs = ttl.as_secs(), "promoted");
                }
                Err(err) => {
                    warn!(key = %key, from = %hit_tier, to = %tier, error = %err, "promotion failed");
                    self.note_failure(*tier, &err);
                }
            }
        }
    }

    fn note_success(&self, tier: Tier) {
        self.inner.health.note_success(tier);
        if self.inner.registry.is_available(tier) {
            self.inner.registry.set_state(tier, TierState::Healthy);
        }
    }

    fn note_failure(&self, tier: Tier, err: &CacheError) {
        self.record_error_for(tier, err);
        self.inner.health.note_failure(tier, &err.to_string());
        if let Some(verdict) = self.inner.health.verdict(tier) {
            self.apply_verdict(tier, verdict);
        }
    }

    fn apply_verdict(&self, tier: Tier, verdict: HealthVerdict) {
        let state = match verdict {
            HealthVerdict::Healthy => TierState::Healthy,
            HealthVerdict::Degraded => TierState::Degraded,
            HealthVerdict::Unhealthy => TierState::Unhealthy,
        };
        if self.inner.registry.is_available(tier) {
            self.inner.registry.set_state(tier, state);
        }
    }

    fn record_error(&self, err: &CacheError) {
        *self.inner.last_error.lock() = Some(err.to_string());
    }

    fn record_error_for(&self, tier: Tier, err: &CacheError) {
        warn!(tier = %tier, error = %err, "tier operation failed");
        *self.inner.last_error.lock() = Some(format!("{tier}: {err}"));
    }
}

/// Build the adapter variant for one tier, or `None` when its backend
/// support is compiled out.
fn build_adapter(
    tier: Tier,
    config: &EngineConfig,
    keys: &Arc<KeyManager>,
) -> CacheResult<Option<Box<dyn TierAdapter>>> {
    let adapter: Option<Box<dyn TierAdapter>> = match tier {
        Tier::Memory => {
            #[cfg(feature = "moka")]
            {
                Some(Box::new(crate::adapters::MemoryAdapter::new(
                    Arc::clone(keys),
                    &config.memory,
                )))
            }
            #[cfg(not(feature = "moka"))]
            {
                None
            }
        }
        Tier::Striped => Some(Box::new(crate::adapters::StripedAdapter::new(Arc::clone(
            keys,
        )))),
        Tier::Shm => Some(Box::new(crate::adapters::ShmAdapter::new(
            Arc::clone(keys),
            config.shm.clone(),
        ))),
        Tier::Shared => Some(Box::new(crate::adapters::SharedAdapter::new(Arc::clone(
            keys,
        )))),
        Tier::Scratch => {
            #[cfg(feature = "backend-quickcache")]
            {
                Some(Box::new(crate::adapters::ScratchAdapter::new(Arc::clone(
                    keys,
                ))))
            }
            #[cfg(not(feature = "backend-quickcache"))]
            {
                None
            }
        }
        Tier::Mmap => Some(Box::new(crate::adapters::MmapAdapter::new(
            Arc::clone(keys),
            config.mmap.clone(),
            config.path.clone(),
        ))),
        Tier::Redis => {
            #[cfg(feature = "redis")]
            {
                Some(Box::new(crate::adapters::RedisAdapter::new(
                    Arc::clone(keys),
                    &config.redis,
                )?))
            }
            #[cfg(not(feature = "redis"))]
            {
                None
            }
        }
        Tier::Memcached => {
            #[cfg(feature = "backend-memcached")]
            {
                Some(Box::new(crate::adapters::MemcachedAdapter::new(
                    Arc::clone(keys),
                    &config.memcached,
                )))
            }
            #[cfg(not(feature = "backend-memcached"))]
            {
                None
            }
        }
        Tier::File => Some(Box::new(crate::adapters::FileAdapter::new(
            Arc::clone(keys),
            config.file.clone(),
            config.path.clone(),
        ))),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CacheEngineBuilder;

    fn local_engine() -> CacheEngine {
        CacheEngineBuilder::new()
            .with_tiers(&[Tier::Striped, Tier::Shared])
            .build()
            .expect("engine")
    }

    #[test]
    fn lifecycle_uninitialized_ready_closed() {
        let engine = local_engine();
        assert_eq!(engine.phase(), EnginePhase::Uninitialized);

        assert!(engine.get("k").expect("get").is_none());
        assert_eq!(engine.phase(), EnginePhase::Ready);

        engine.close();
        assert_eq!(engine.phase(), EnginePhase::Closed);

        // Any call after close re-initializes.
        assert!(engine.set("k", b"v", Duration::from_secs(60)).expect("set"));
        assert_eq!(engine.phase(), EnginePhase::Ready);
        assert_eq!(engine.get("k").expect("get"), Some(b"v".to_vec()));
    }

    #[test]
    fn empty_key_and_empty_value_rejections() {
        let engine = local_engine();
        assert!(matches!(engine.get(""), Err(CacheError::InvalidKey(_))));
        assert!(matches!(
            engine.delete(""),
            Err(CacheError::InvalidKey(_))
        ));

        assert!(!engine.set("k", b"", Duration::from_secs(60)).expect("set"));
        assert_eq!(
            engine.get_last_error().as_deref(),
            Some("empty values are not cached")
        );
    }

    #[test]
    fn tier_scoped_validation_order() {
        let engine = local_engine();
        // Not configured at all.
        assert!(matches!(
            engine.get_from_tier("k", Tier::Redis),
            Err(CacheError::InvalidTier(_))
        ));

        // Configured and available.
        engine
            .set_to_tier("k", b"v", Duration::from_secs(60), Tier::Shared)
            .expect("set");
        assert_eq!(
            engine.get_from_tier("k", Tier::Shared).expect("get"),
            Some(b"v".to_vec())
        );
        // Other tier does not see the tier-scoped write.
        assert_eq!(engine.get_from_tier("k", Tier::Striped).expect("get"), None);
    }

    #[test]
    fn batch_report_counts_invalid_tiers_as_failures() {
        let engine = local_engine();
        let report = engine
            .set_to_tiers(
                "k",
                b"v",
                Duration::from_secs(60),
                &[Tier::Shared, Tier::Redis],
            )
            .expect("report");
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.successful, 1);
        assert_eq!(report.summary.failed, 1);
        assert!(matches!(
            report.results.get(&Tier::Redis),
            Some(Err(CacheError::InvalidTier(_)))
        ));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let engine = local_engine();
        engine.set("k", b"v", Duration::from_secs(60)).expect("set");
        engine.get("k").expect("get");
        engine.get("absent").expect("get");

        let stats = engine.get_stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.last_used_tier, Some(Tier::Striped));
    }

    #[test]
    fn debug_snapshot_is_serializable() {
        let engine = local_engine();
        engine.set("k", b"v", Duration::from_secs(60)).expect("set");
        let snapshot = engine.debug();
        assert_eq!(snapshot["namespace"], "app");
        assert!(snapshot["tiers"].as_array().is_some_and(|t| t.len() == 2));
    }

    #[test]
    fn get_or_set_computes_once() {
        let engine = local_engine();
        let mut calls = 0;
        let value = engine
            .get_or_set("lazy", Duration::from_secs(60), || {
                calls += 1;
                Ok(b"computed".to_vec())
            })
            .expect("get_or_set");
        assert_eq!(value, b"computed");
        assert_eq!(calls, 1);

        let again = engine
            .get_or_set("lazy", Duration::from_secs(60), || {
                unreachable!("value is cached")
            })
            .expect("get_or_set");
        assert_eq!(again, b"computed");
    }
}

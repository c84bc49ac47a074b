//! Health monitor: TTL-cached probe verdicts per tier.
//!
//! The monitor re-probes a tier at most once per `probe_ttl` and otherwise
//! answers from cache. Operation outcomes feed back through
//! [`HealthMonitor::note_success`]/[`HealthMonitor::note_failure`], so a
//! tier can degrade between probes. The monitor only annotates — it never
//! removes a tier from the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::adapters::TierAdapter;
use crate::config::HealthConfig;
use crate::tier::Tier;

/// Runtime health verdict for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    /// Last probe and recent operations succeeded.
    Healthy,
    /// Transient failures below the threshold; the tier is still used.
    Degraded,
    /// Failure threshold reached; the tier is skipped until a probe
    /// succeeds again.
    Unhealthy,
}

#[derive(Debug, Clone)]
struct TierHealth {
    verdict: HealthVerdict,
    checked_at: Instant,
    consecutive_failures: u32,
    last_cause: Option<String>,
}

/// Aggregate monitor counters for `get_monitoring_stats`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MonitoringStats {
    /// Tiers with a cached verdict.
    pub tracked: usize,
    /// Tiers currently healthy.
    pub healthy: usize,
    /// Tiers currently degraded.
    pub degraded: usize,
    /// Tiers currently unhealthy.
    pub unhealthy: usize,
    /// Probes actually executed (cache misses).
    pub probes_run: u64,
}

/// Periodic per-tier prober with cached verdicts.
pub struct HealthMonitor {
    config: HealthConfig,
    records: DashMap<Tier, TierHealth>,
    probes_run: AtomicU64,
}

impl HealthMonitor {
    /// Build a monitor from the health config section.
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            probes_run: AtomicU64::new(0),
        }
    }

    /// Verdict for `tier`, re-probing through `adapter` when the cached
    /// verdict is older than the probe TTL.
    pub fn check(&self, tier: Tier, adapter: &dyn TierAdapter) -> HealthVerdict {
        if let Some(record) = self.records.get(&tier) {
            if record.checked_at.elapsed() < self.config.probe_ttl() {
                return record.verdict;
            }
        }
        self.probe(tier, adapter)
    }

    /// Force a probe regardless of cache freshness.
    pub fn probe(&self, tier: Tier, adapter: &dyn TierAdapter) -> HealthVerdict {
        self.probes_run.fetch_add(1, Ordering::Relaxed);
        match adapter.probe() {
            Ok(()) => {
                debug!(tier = %tier, "health probe passed");
                self.records.insert(
                    tier,
                    TierHealth {
                        verdict: HealthVerdict::Healthy,
                        checked_at: Instant::now(),
                        consecutive_failures: 0,
                        last_cause: None,
                    },
                );
                HealthVerdict::Healthy
            }
            Err(err) => {
                let failures = self
                    .records
                    .get(&tier)
                    .map_or(0, |r| r.consecutive_failures)
                    .saturating_add(1);
                let verdict = self.verdict_for(failures);
                warn!(tier = %tier, failures, error = %err, "health probe failed");
                self.records.insert(
                    tier,
                    TierHealth {
                        verdict,
                        checked_at: Instant::now(),
                        consecutive_failures: failures,
                        last_cause: Some(err.to_string()),
                    },
                );
                verdict
            }
        }
    }

    /// Record a successful operation: failures reset, verdict restores to
    /// healthy without waiting for the next probe.
    pub fn note_success(&self, tier: Tier) {
        if let Some(mut record) = self.records.get_mut(&tier) {
            record.consecutive_failures = 0;
            record.verdict = HealthVerdict::Healthy;
            record.last_cause = None;
        }
    }

    /// Record a failed operation; at the configured threshold the tier
    /// turns unhealthy and is skipped until a probe succeeds.
    pub fn note_failure(&self, tier: Tier, cause: &str) {
        let mut record = self.records.entry(tier).or_insert_with(|| TierHealth {
            verdict: HealthVerdict::Healthy,
            checked_at: Instant::now(),
            consecutive_failures: 0,
            last_cause: None,
        });
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.verdict = self.verdict_for(record.consecutive_failures);
        record.last_cause = Some(cause.to_string());
        if record.verdict == HealthVerdict::Unhealthy {
            warn!(tier = %tier, failures = record.consecutive_failures, "tier demoted to unhealthy");
        }
    }

    /// Whether the dispatcher may route to `tier` right now. Degraded tiers
    /// are still used; unhealthy ones are skipped.
    #[must_use]
    pub fn is_usable(&self, tier: Tier) -> bool {
        self.records
            .get(&tier)
            .is_none_or(|r| r.verdict != HealthVerdict::Unhealthy)
    }

    /// Cached verdict without probing; `None` when the tier was never
    /// checked.
    #[must_use]
    pub fn verdict(&self, tier: Tier) -> Option<HealthVerdict> {
        self.records.get(&tier).map(|r| r.verdict)
    }

    /// Consecutive failure count for `tier`.
    #[must_use]
    pub fn consecutive_failures(&self, tier: Tier) -> u32 {
        self.records.get(&tier).map_or(0, |r| r.consecutive_failures)
    }

    /// Last recorded failure cause for `tier`.
    #[must_use]
    pub fn last_cause(&self, tier: Tier) -> Option<String> {
        self.records.get(&tier).and_then(|r| r.last_cause.clone())
    }

    /// Probe every adapter through the verdict cache and collect verdicts.
    pub fn check_all<'a, I>(&self, adapters: I) -> Vec<(Tier, HealthVerdict)>
    where
        I: IntoIterator<Item = (Tier, &'a dyn TierAdapter)>,
    {
        adapters
            .into_iter()
            .map(|(tier, adapter)| (tier, self.check(tier, adapter)))
            .collect()
    }

    /// Aggregate counters.
    #[must_use]
    pub fn monitoring_stats(&self) -> MonitoringStats {
        let mut stats = MonitoringStats {
            tracked: self.records.len(),
            probes_run: self.probes_run.load(Ordering::Relaxed),
            ..MonitoringStats::default()
        };
        for record in &self.records {
            match record.verdict {
                HealthVerdict::Healthy => stats.healthy += 1,
                HealthVerdict::Degraded => stats.degraded += 1,
                HealthVerdict::Unhealthy => stats.unhealthy += 1,
            }
        }
        stats
    }

    /// Drop every cached verdict (engine close).
    pub fn reset(&self) {
        self.records.clear();
    }

    fn verdict_for(&self, failures: u32) -> HealthVerdict {
        if failures >= self.config.consecutive_failure_threshold {
            HealthVerdict::Unhealthy
        } else {
            HealthVerdict::Degraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::shared::SharedAdapter;
    use crate::config::EngineConfig;
    use crate::keys::KeyManager;
    use std::sync::Arc;

    fn monitor(threshold: u32) -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            probe_ttl_seconds: 3600,
            consecutive_failure_threshold: threshold,
        })
    }

    fn adapter() -> SharedAdapter {
        let config = EngineConfig::default();
        let scopes = crate::tier::Tier::ALL
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
    fn fresh_probe_is_cached() {
        let monitor = monitor(3);
        let adapter = adapter();
        assert_eq!(
            monitor.check(Tier::Shared, &adapter),
            HealthVerdict::Healthy
        );
        assert_eq!(
            monitor.check(Tier::Shared, &adapter),
            HealthVerdict::Healthy
        );
        assert_eq!(monitor.monitoring_stats().probes_run, 1);
    }

    #[test]
    fn failures_degrade_then_demote_at_threshold() {
        let monitor = monitor(3);
        monitor.note_failure(Tier::Redis, "io");
        assert_eq!(monitor.verdict(Tier::Redis), Some(HealthVerdict::Degraded));
        assert!(monitor.is_usable(Tier::Redis));

        monitor.note_failure(Tier::Redis, "io");
        monitor.note_failure(Tier::Redis, "io");
        assert_eq!(monitor.verdict(Tier::Redis), Some(HealthVerdict::Unhealthy));
        assert!(!monitor.is_usable(Tier::Redis));
        assert_eq!(monitor.consecutive_failures(Tier::Redis), 3);
        assert_eq!(monitor.last_cause(Tier::Redis).as_deref(), Some("io"));
    }

    #[test]
    fn success_resets_failures() {
        let monitor = monitor(2);
        monitor.note_failure(Tier::File, "disk");
        monitor.note_success(Tier::File);
        assert_eq!(monitor.verdict(Tier::File), Some(HealthVerdict::Healthy));
        assert_eq!(monitor.consecutive_failures(Tier::File), 0);
    }

    #[test]
    fn unknown_tier_is_usable_by_default() {
        let monitor = monitor(3);
        assert!(monitor.is_usable(Tier::Mmap));
        assert_eq!(monitor.verdict(Tier::Mmap), None);
    }

    #[test]
    fn probe_restores_an_unhealthy_tier() {
        let monitor = monitor(1);
        monitor.note_failure(Tier::Shared, "transient");
        assert!(!monitor.is_usable(Tier::Shared));

        let adapter = adapter();
        assert_eq!(
            monitor.probe(Tier::Shared, &adapter),
            HealthVerdict::Healthy
        );
        assert!(monitor.is_usable(Tier::Shared));
    }
}

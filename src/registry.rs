//! Tier registry: which tiers exist, which survived discovery, and where
//! each one sits in its lifecycle.
//!
//! The registry is read-mostly: the dispatcher snapshots the available
//! order on every operation, while writers are discovery and monitor
//! ticks. Health demotion never removes a tier from the registry — the
//! tier is skipped for reads and writes but stays listed for status
//! reporting.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CacheResult;
use crate::tier::Tier;

/// Dispatcher-visible lifecycle of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierState {
    /// Never probed.
    Unknown,
    /// Discovery has seen the tier but not probed it yet.
    Discovered,
    /// Discovery probe succeeded; not yet through a monitor pass.
    Available,
    /// Most recent probe and operations succeeded.
    Healthy,
    /// Transient failures observed; still used.
    Degraded,
    /// Failure threshold reached; skipped for reads and writes.
    Unhealthy,
    /// Engine was closed.
    Closed,
}

/// Ordered tier bookkeeping.
pub struct TierRegistry {
    /// Configured subset of the closed enumeration, priority order.
    valid: Vec<Tier>,
    /// Tiers that passed their discovery probe, priority order.
    available: RwLock<Vec<Tier>>,
    states: DashMap<Tier, TierState>,
}

impl TierRegistry {
    /// Build a registry for the configured tiers. The order callers pass is
    /// irrelevant; the registry always holds priority order, deduplicated.
    #[must_use]
    pub fn new(mut configured: Vec<Tier>) -> Self {
        configured.sort_by_key(|t| t.priority());
        configured.dedup();
        let states = DashMap::new();
        for tier in &configured {
            states.insert(*tier, TierState::Unknown);
        }
        Self {
            valid: configured,
            available: RwLock::new(Vec::new()),
            states,
        }
    }

    /// The configured tier set in priority order.
    #[must_use]
    pub fn valid_tiers(&self) -> &[Tier] {
        &self.valid
    }

    /// Whether `tier` belongs to the configured set.
    #[must_use]
    pub fn is_valid(&self, tier: Tier) -> bool {
        self.valid.contains(&tier)
    }

    /// Record discovery probe outcomes and rebuild the available order.
    pub fn record_discovery<'a, I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = (Tier, &'a CacheResult<()>)>,
    {
        let mut available = Vec::new();
        for (tier, outcome) in outcomes {
            self.states.insert(tier, TierState::Discovered);
            match outcome {
                Ok(()) => {
                    available.push(tier);
                    self.states.insert(tier, TierState::Available);
                    debug!(tier = %tier, "tier available");
                }
                Err(err) => {
                    self.states.insert(tier, TierState::Unhealthy);
                    warn!(tier = %tier, error = %err, "tier failed discovery probe");
                }
            }
        }
        available.sort_by_key(|t| t.priority());
        info!(
            count = available.len(),
            of = self.valid.len(),
            "tier discovery complete"
        );
        *self.available.write() = available;
    }

    /// Snapshot of the available tiers, strictly sorted by priority.
    #[must_use]
    pub fn available_tiers(&self) -> Vec<Tier> {
        self.available.read().clone()
    }

    /// Whether `tier` passed its discovery probe.
    #[must_use]
    pub fn is_available(&self, tier: Tier) -> bool {
        self.available.read().contains(&tier)
    }

    /// Re-probe outcome for a single tier (used by `set_cache_path`, which
    /// can bring the file-backed tiers in or out of the available set).
    pub fn record_reprobe(&self, tier: Tier, outcome: &CacheResult<()>) {
        let mut available = self.available.write();
        match outcome {
            Ok(()) => {
                if !available.contains(&tier) {
                    available.push(tier);
                    available.sort_by_key(|t| t.priority());
                }
                self.states.insert(tier, TierState::Available);
            }
            Err(err) => {
                available.retain(|t| *t != tier);
                self.states.insert(tier, TierState::Unhealthy);
                warn!(tier = %tier, error = %err, "tier dropped from available set");
            }
        }
    }

    /// Current lifecycle state for `tier`.
    #[must_use]
    pub fn state(&self, tier: Tier) -> TierState {
        self.states
            .get(&tier)
            .map_or(TierState::Unknown, |s| *s.value())
    }

    /// Overwrite the lifecycle state for `tier` (monitor verdicts).
    pub fn set_state(&self, tier: Tier, state: TierState) {
        if self.is_valid(tier) {
            self.states.insert(tier, state);
        }
    }

    /// Mark every tier closed and forget availability. The next discovery
    /// pass starts from scratch.
    pub fn mark_closed(&self) {
        for tier in &self.valid {
            self.states.insert(*tier, TierState::Closed);
        }
        self.available.write().clear();
    }
}

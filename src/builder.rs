//! Cache engine builder.
//!
//! Thin fluent layer over [`EngineConfig`]; every method rewrites one
//! config section and `build` hands the finished record to
//! [`CacheEngine::new`]. Nothing is probed or connected until the engine's
//! first public call.
//!
//! # Example
//!
//! ```rust,no_run
//! use stratacache::{CacheEngineBuilder, Tier};
//!
//! fn main() -> Result<(), stratacache::CacheError> {
//!     let engine = CacheEngineBuilder::new()
//!         .with_prefix("svc:")
//!         .with_tiers(&[Tier::Memory, Tier::Redis, Tier::File])
//!         .with_redis_addr("cache.internal", 6379)
//!         .build()?;
//!
//!     engine.set("user:1", b"alice", std::time::Duration::from_secs(300))?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;

use crate::config::{EngineConfig, HashAlgorithm, NetworkConfig};
use crate::engine::CacheEngine;
use crate::error::CacheResult;
use crate::tier::Tier;

/// Builder for [`CacheEngine`].
#[derive(Debug, Clone, Default)]
pub struct CacheEngineBuilder {
    config: EngineConfig,
}

impl CacheEngineBuilder {
    /// Start from the default configuration (all tiers, local backends).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration record.
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Restrict the engine to a subset of the tier enumeration.
    #[must_use]
    pub fn with_tiers(mut self, tiers: &[Tier]) -> Self {
        self.config.tiers = tiers.to_vec();
        self
    }

    /// Global namespace prefix (default `"app:"`).
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Key component separator (default `":"`).
    #[must_use]
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.config.keys.separator = separator.into();
        self
    }

    /// Digest used for overflow key forms (default SHA-256).
    #[must_use]
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.keys.hash_algorithm = algorithm;
        self
    }

    /// Global cache directory for the file-backed tiers.
    #[must_use]
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Redis host and port, keeping the section's other defaults.
    #[must_use]
    pub fn with_redis_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.redis.host = host.into();
        self.config.redis.port = port;
        self
    }

    /// Full Redis section.
    #[must_use]
    pub fn with_redis(mut self, redis: NetworkConfig) -> Self {
        self.config.redis = redis;
        self
    }

    /// Memcached host and port, keeping the section's other defaults.
    #[must_use]
    pub fn with_memcached_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.memcached.host = host.into();
        self.config.memcached.port = port;
        self
    }

    /// Full Memcached section.
    #[must_use]
    pub fn with_memcached(mut self, memcached: NetworkConfig) -> Self {
        self.config.memcached = memcached;
        self
    }

    /// Health monitor probe TTL in seconds (default 30).
    #[must_use]
    pub fn with_probe_ttl_seconds(mut self, seconds: u64) -> Self {
        self.config.health.probe_ttl_seconds = seconds;
        self
    }

    /// Consecutive failures before a tier is demoted (default 3).
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.health.consecutive_failure_threshold = threshold;
        self
    }

    /// Mutable access to the whole config for options without a dedicated
    /// builder method.
    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// See [`CacheEngine::new`].
    pub fn build(self) -> CacheResult<CacheEngine> {
        CacheEngine::new(self.config)
    }
}

//! Engine configuration.
//!
//! Configuration is an immutable record handed to the engine at
//! construction; there are no ambient globals. All sections derive
//! `serde` so deployments can load them from files, and every field has a
//! default, so `EngineConfig::default()` is a working local-only setup.
//!
//! Durations are stored as plain seconds/millis fields to keep serialized
//! configs obvious; accessors return [`Duration`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tier::Tier;

/// Default namespace prefix applied to every tier-local key.
pub const DEFAULT_PREFIX: &str = "app:";

/// Top-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tiers the engine should discover, in any order; the registry always
    /// iterates them by priority. Defaults to the full closed set.
    pub tiers: Vec<Tier>,
    /// Global cache directory for the on-disk and mapped-file tiers when
    /// their sections leave `path`/`base_path` unset.
    pub path: Option<PathBuf>,
    /// Global namespace prefix, e.g. `"app:"`.
    pub prefix: String,
    /// Key-manager options.
    pub keys: KeyConfig,
    /// Health-monitor options.
    pub health: HealthConfig,
    /// In-process `Memory` tier options.
    pub memory: MemoryConfig,
    /// Redis tier options.
    pub redis: NetworkConfig,
    /// Memcached tier options.
    pub memcached: NetworkConfig,
    /// Memory-mapped tier options.
    pub mmap: MmapConfig,
    /// Shared-memory tier options.
    pub shm: ShmConfig,
    /// On-disk file tier options.
    pub file: FileConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tiers: Tier::ALL.to_vec(),
            path: None,
            prefix: DEFAULT_PREFIX.to_string(),
            keys: KeyConfig::default(),
            health: HealthConfig::default(),
            memory: MemoryConfig::default(),
            redis: NetworkConfig::redis_defaults(),
            memcached: NetworkConfig::memcached_defaults(),
            mmap: MmapConfig::default(),
            shm: ShmConfig::default(),
            file: FileConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Namespace used by the key manager: the explicit key-manager namespace
    /// when set, otherwise the global prefix with any trailing separator
    /// trimmed.
    #[must_use]
    pub fn namespace(&self) -> String {
        match &self.keys.global_namespace {
            Some(ns) => ns.clone(),
            None => self
                .prefix
                .trim_end_matches(self.keys.separator.as_str())
                .to_string(),
        }
    }
}

/// Hash algorithms the key manager can use for overflow keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    /// 256-bit digest, 64 hex characters.
    #[default]
    Sha256,
    /// 384-bit digest, 96 hex characters.
    Sha384,
    /// 512-bit digest, 128 hex characters.
    Sha512,
}

/// Key-manager options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Namespace component of every tier-local key. `None` derives it from
    /// the global prefix.
    pub global_namespace: Option<String>,
    /// Separator between key components.
    pub separator: String,
    /// Hash keys that exceed a tier's limits instead of rejecting them.
    pub auto_hash_long_keys: bool,
    /// Digest used for hashed key forms.
    pub hash_algorithm: HashAlgorithm,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            global_namespace: None,
            separator: ":".to_string(),
            auto_hash_long_keys: true,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

/// Health-monitor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How long a probe verdict stays fresh before the next check re-probes.
    pub probe_ttl_seconds: u64,
    /// Consecutive failures that demote a degraded tier to unhealthy.
    pub consecutive_failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_ttl_seconds: 30,
            consecutive_failure_threshold: 3,
        }
    }
}

impl HealthConfig {
    /// Probe freshness window as a [`Duration`].
    #[must_use]
    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_seconds)
    }
}

/// `Memory` tier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of entries before eviction.
    pub max_capacity: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_capacity: 10_000 }
    }
}

/// Options shared by the network tiers (Redis-like and Memcached-like).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Backend host.
    pub host: String,
    /// Backend port.
    pub port: u16,
    /// Logical database index; honored by Redis only.
    pub database_index: u32,
    /// Tier-scope override mixed into keys for this backend.
    pub prefix: Option<String>,
    /// TCP connect deadline. Also bounds pool `acquire` waits.
    pub connect_timeout_seconds: u64,
    /// Per-operation read deadline.
    pub read_timeout_seconds: u64,
    /// Keep connections pooled between operations. When `false` every
    /// released connection is closed instead of parked idle.
    pub persistent: bool,
    /// Connect retries before a connection attempt is reported failed.
    pub retry_attempts: u32,
    /// Delay between connect retries.
    pub retry_delay_millis: u64,
    /// Pool bounds for this backend.
    pub pool: PoolConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::redis_defaults()
    }
}

impl NetworkConfig {
    /// Defaults for a local Redis.
    #[must_use]
    pub fn redis_defaults() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database_index: 0,
            prefix: None,
            connect_timeout_seconds: 2,
            read_timeout_seconds: 2,
            persistent: true,
            retry_attempts: 2,
            retry_delay_millis: 100,
            pool: PoolConfig::default(),
        }
    }

    /// Defaults for a local Memcached.
    #[must_use]
    pub fn memcached_defaults() -> Self {
        Self {
            port: 11211,
            ..Self::redis_defaults()
        }
    }

    /// Connect deadline as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Read deadline as a [`Duration`].
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// Pause between connect retries as a [`Duration`].
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_millis)
    }
}

/// Bounds for one backend's connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open while the pool is open.
    pub min: usize,
    /// Hard ceiling on idle + leased connections.
    pub max: usize,
    /// Idle age beyond which `reap_idle` closes a connection.
    pub idle_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            idle_timeout_seconds: 300,
        }
    }
}

impl PoolConfig {
    /// Idle age limit as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

/// Memory-mapped tier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MmapConfig {
    /// Directory holding the mapped entry files. `None` falls back to the
    /// global `path` (plus an `mmap` component) and then the system temp dir.
    pub base_path: Option<PathBuf>,
    /// Fixed size every entry file is padded to.
    pub file_size_bytes: u64,
    /// Ceiling on entry files; the oldest file is evicted when reached.
    pub max_files: usize,
    /// Tier-scope override mixed into keys for this backend.
    pub prefix: Option<String>,
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            file_size_bytes: 1_048_576,
            max_files: 1000,
            prefix: None,
        }
    }
}

/// Shared-memory tier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Segment root. `None` uses `/dev/shm` when present, else the system
    /// temp dir.
    pub base_path: Option<PathBuf>,
    /// Ceiling on a single segment (expiry prefix + payload).
    pub segment_size_bytes: u64,
    /// Base of the numeric segment id space.
    pub base_numeric_key: u64,
    /// Tier-scope override mixed into keys for this backend.
    pub prefix: Option<String>,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            segment_size_bytes: 1_048_576,
            base_numeric_key: 0x1234_5000,
            prefix: None,
        }
    }
}

/// On-disk file tier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Cache directory. `None` starts the fallback cascade: global `path`,
    /// then a PID-qualified temp default, then a uniquified temp dir.
    pub path: Option<PathBuf>,
    /// Mode bits for created cache directories.
    pub directory_permissions: u32,
    /// Tier-scope override mixed into keys for this backend.
    pub prefix: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: None,
            directory_permissions: 0o755,
            prefix: None,
        }
    }
}

impl EngineConfig {
    /// Scope token for `tier`, honoring per-backend prefix overrides.
    #[must_use]
    pub fn tier_scope(&self, tier: Tier) -> String {
        let override_prefix = match tier {
            Tier::Redis => self.redis.prefix.as_deref(),
            Tier::Memcached => self.memcached.prefix.as_deref(),
            Tier::Mmap => self.mmap.prefix.as_deref(),
            Tier::Shm => self.shm.prefix.as_deref(),
            Tier::File => self.file.prefix.as_deref(),
            _ => None,
        };
        override_prefix.unwrap_or(tier.scope()).to_string()
    }
}

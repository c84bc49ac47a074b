//! Multi-Tier Cache Engine
//!
//! A single key/value contract over many backing stores of varying speed
//! and capacity:
//! - **In-process tiers**: Moka, a lock-striped map, `DashMap`, `quick_cache`
//! - **Shared-memory tiers**: per-entry segments and memory-mapped files
//! - **Network tiers**: Redis and Memcached over bounded connection pools
//! - **On-disk tier**: expiry-prefixed cache files with atomic writes
//!
//! Reads scan the available tiers in priority order and transparently
//! promote hits toward the faster tiers; writes fan out across every
//! usable tier; a health monitor demotes failing tiers and restores them
//! when probes pass again. Backends that lack native TTL get a uniform
//! expiration discipline (an `expires_at` prefix plus a sweep).
//!
//! The engine is synchronous: blocking points are network I/O, file I/O,
//! advisory file locks, and pool acquisition. It is safe to share one
//! engine handle across threads; wrap calls in your own task layer if you
//! need an async surface.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stratacache::{CacheEngineBuilder, Tier};
//!
//! fn main() -> Result<(), stratacache::CacheError> {
//!     let engine = CacheEngineBuilder::new()
//!         .with_prefix("app:")
//!         .build()?;
//!
//!     engine.set("user:42", b"alice", Duration::from_secs(3600))?;
//!     if let Some(value) = engine.get("user:42")? {
//!         println!("cached: {}", String::from_utf8_lossy(&value));
//!     }
//!
//!     // Tier-scoped access and status.
//!     let tiers = engine.get_available_tiers();
//!     println!("available tiers: {tiers:?}");
//!     println!("stats: {:?}", engine.get_stats());
//!
//!     engine.close();
//!     Ok(())
//! }
//! ```
//!
//! # Failure semantics
//!
//! A single tier failing never fails a `get` — the scan continues. A `set`
//! succeeds when any tier accepted the write (partial success). `delete`
//! and `clear` are strict: one real error fails the operation. Adapter
//! errors become [`CacheError`] values, never panics, and the most recent
//! one is kept for [`CacheEngine::get_last_error`].

pub mod adapters;
pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod keys;
pub mod pool;
pub mod registry;
pub mod tier;

pub use builder::CacheEngineBuilder;
pub use config::{
    EngineConfig, FileConfig, HashAlgorithm, HealthConfig, KeyConfig, MemoryConfig, MmapConfig,
    NetworkConfig, PoolConfig, ShmConfig,
};
pub use engine::{
    BatchSummary, CacheEngine, EnginePhase, EngineStats, PROMOTION_TTL, TierBatchReport,
    TierStatus,
};
pub use error::{CacheError, CacheResult};
pub use health::{HealthMonitor, HealthVerdict, MonitoringStats};
pub use keys::KeyManager;
pub use pool::{ConnectionPool, Connector, PoolStats, PooledConn};
pub use registry::{TierRegistry, TierState};
pub use tier::{Tier, TierKind};

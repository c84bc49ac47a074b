//! The closed tier set and its fixed properties.
//!
//! Tiers are ordered by priority: smaller numbers sit closer to the CPU and
//! are scanned first on reads. The set is closed — callers route by [`Tier`]
//! value, never by arbitrary strings — but `FromStr` is provided for
//! configuration files and CLI surfaces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A single backend store, one of the closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Moka in-process cache with per-entry TTL. Fastest tier.
    Memory,
    /// Lock-striped in-process map, sharded by key hash.
    Striped,
    /// Shared-memory segments, one per entry, addressed by numeric id.
    Shm,
    /// `DashMap`-backed map shared across threads.
    Shared,
    /// Bounded scratch cache (`quick_cache`).
    Scratch,
    /// Memory-mapped files, one fixed-size file per entry.
    Mmap,
    /// Redis network KV.
    Redis,
    /// Memcached network KV.
    Memcached,
    /// On-disk cache files.
    File,
}

/// Coarse classification of a tier's substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Lives inside this process; non-blocking.
    InProcess,
    /// Shared-memory segments or memory-mapped files.
    SharedMemory,
    /// Remote KV reached over a pooled connection.
    Network,
    /// Plain files on disk.
    OnDisk,
}

impl Tier {
    /// Every tier in priority order (fastest first). This is the
    /// read-scan and promotion ordering.
    pub const ALL: [Tier; 9] = [
        Tier::Memory,
        Tier::Striped,
        Tier::Shm,
        Tier::Shared,
        Tier::Scratch,
        Tier::Mmap,
        Tier::Redis,
        Tier::Memcached,
        Tier::File,
    ];

    /// Position in the hierarchy; unique, smaller = faster.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Tier::Memory => 10,
            Tier::Striped => 20,
            Tier::Shm => 30,
            Tier::Shared => 40,
            Tier::Scratch => 50,
            Tier::Mmap => 60,
            Tier::Redis => 70,
            Tier::Memcached => 80,
            Tier::File => 90,
        }
    }

    /// Substrate classification.
    #[must_use]
    pub fn kind(self) -> TierKind {
        match self {
            Tier::Memory | Tier::Striped | Tier::Shared | Tier::Scratch => TierKind::InProcess,
            Tier::Shm | Tier::Mmap => TierKind::SharedMemory,
            Tier::Redis | Tier::Memcached => TierKind::Network,
            Tier::File => TierKind::OnDisk,
        }
    }

    /// Whether the substrate expires entries on its own. Tiers without
    /// native TTL store an `expires_at` prefix and are covered by the
    /// expiration sweep.
    #[must_use]
    pub fn supports_native_ttl(self) -> bool {
        !matches!(self, Tier::Shm | Tier::Mmap | Tier::File)
    }

    /// Longest tier-local key the backend accepts.
    #[must_use]
    pub fn max_key_length(self) -> usize {
        match self {
            Tier::Memory | Tier::Striped | Tier::Shared | Tier::Scratch => 1024,
            Tier::Shm | Tier::Mmap | Tier::File => 255,
            Tier::Redis => 512,
            Tier::Memcached => 250,
        }
    }

    /// Whether `c` may appear in a tier-local key for this backend.
    #[must_use]
    pub fn key_char_allowed(self, c: char) -> bool {
        match self {
            Tier::Memory | Tier::Striped | Tier::Shared | Tier::Scratch => true,
            // Stored names are filesystem path components.
            Tier::Shm | Tier::Mmap | Tier::File => {
                c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')
            }
            Tier::Redis => !c.is_control(),
            // Memcached forbids whitespace and control bytes outright.
            Tier::Memcached => c.is_ascii_graphic(),
        }
    }

    /// Short scope token mixed into tier-local keys so sibling tiers on a
    /// shared substrate never collide.
    #[must_use]
    pub fn scope(self) -> &'static str {
        match self {
            Tier::Memory => "mem",
            Tier::Striped => "striped",
            Tier::Shm => "shm",
            Tier::Shared => "shared",
            Tier::Scratch => "scratch",
            Tier::Mmap => "mmap",
            Tier::Redis => "redis",
            Tier::Memcached => "memcached",
            Tier::File => "file",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scope())
    }
}

impl FromStr for Tier {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mem" | "memory" => Ok(Tier::Memory),
            "striped" => Ok(Tier::Striped),
            "shm" => Ok(Tier::Shm),
            "shared" => Ok(Tier::Shared),
            "scratch" => Ok(Tier::Scratch),
            "mmap" => Ok(Tier::Mmap),
            "redis" => Ok(Tier::Redis),
            "memcached" => Ok(Tier::Memcached),
            "file" => Ok(Tier::File),
            other => Err(CacheError::InvalidTier(other.to_string())),
        }
    }
}

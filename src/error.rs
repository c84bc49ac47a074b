//! Error taxonomy shared by the engine, adapters, and pools.
//!
//! Every failure the engine can observe collapses into [`CacheError`]. The
//! variants carry owned strings rather than source errors so per-tier result
//! maps (see [`crate::engine::TierBatchReport`]) can clone and retain them.

use thiserror::Error;

use crate::tier::Tier;

/// Result alias used throughout the crate.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// All error kinds surfaced by the cache engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Caller key is empty or otherwise unusable.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Tier name does not belong to the configured tier set.
    #[error("invalid tier: {0}")]
    InvalidTier(String),

    /// Tier failed discovery and is not part of the available set.
    #[error("tier {0} is unavailable")]
    TierUnavailable(Tier),

    /// Tier is available but its most recent health verdict forbids use.
    #[error("tier {0} is unhealthy")]
    TierUnhealthy(Tier),

    /// `set` was called with a zero-length value.
    #[error("empty values are not cached")]
    EmptyValue,

    /// Stored blob could not be decoded (corrupt expiry prefix or record).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A network connection died mid-operation; the pool discards it.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Connect or read deadline elapsed on a network backend.
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    /// Pool reached `max` leased connections and the bounded wait expired.
    #[error("connection pool exhausted for {backend}")]
    PoolExhausted {
        /// Backend the pool serves, e.g. `"redis"`.
        backend: &'static str,
    },

    /// Filesystem-level failure (shm, mmap, and file tiers).
    #[error("i/o error: {0}")]
    Io(String),

    /// Filesystem permission failure, reported distinctly so callers can
    /// tell an unwritable cache directory from a transient fault.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Backend-specific failure with the backend's own code and message.
    #[error("backend error {code}: {message}")]
    Backend {
        /// Numeric code as reported by the backend, 0 when it has none.
        code: i64,
        /// Human-readable backend message.
        message: String,
    },
}

impl CacheError {
    /// Classify a [`std::io::Error`], splitting permission problems out of
    /// the generic i/o bucket.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::ConnectionTimeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }

    /// Backend error helper for substrates without numeric codes.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            code: 0,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::ConnectionTimeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::ConnectionLost(err.to_string())
        } else {
            Self::Backend {
                code: 0,
                message: err.to_string(),
            }
        }
    }
}

#[cfg(feature = "backend-memcached")]
impl From<memcache::MemcacheError> for CacheError {
    fn from(err: memcache::MemcacheError) -> Self {
        match err {
            memcache::MemcacheError::IOError(io) => Self::from_io(&io),
            other => Self::Backend {
                code: 0,
                message: other.to_string(),
            },
        }
    }
}

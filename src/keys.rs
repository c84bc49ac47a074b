//! Key manager: caller key → tier-local key.
//!
//! The rendered form is `[namespace][sep][tier scope][sep][caller key]`.
//! When that exceeds the tier's length limit or contains characters the
//! backend rejects, the variable part collapses to a hex digest of the full
//! composed string, keeping the namespace prefix whenever the tier leaves
//! room for it. Backends whose identifier space is not strings use the
//! parallel special-key functions: a stable numeric id for shared-memory
//! segments and a filesystem-safe stem for mapped/on-disk files.
//!
//! Same inputs always produce the same output across process restarts;
//! changing the namespace or separator invalidates every previously
//! rendered key, which amounts to a cache flush.

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::config::{HashAlgorithm, KeyConfig};
use crate::error::{CacheError, CacheResult};
use crate::tier::Tier;

/// Derives backend-specific key forms from caller keys.
#[derive(Debug, Clone)]
pub struct KeyManager {
    namespace: String,
    separator: String,
    auto_hash_long_keys: bool,
    algorithm: HashAlgorithm,
    scopes: Vec<(Tier, String)>,
}

impl KeyManager {
    /// Build a key manager from the key-manager config section, the resolved
    /// namespace, and the per-tier scope tokens.
    #[must_use]
    pub fn new(config: &KeyConfig, namespace: String, scopes: Vec<(Tier, String)>) -> Self {
        Self {
            namespace,
            separator: config.separator.clone(),
            auto_hash_long_keys: config.auto_hash_long_keys,
            algorithm: config.hash_algorithm,
            scopes,
        }
    }

    /// The process-wide namespace component.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Namespace rendered as a filesystem-safe tag, used by the file-backed
    /// adapters to mark ownership of entry files.
    #[must_use]
    pub fn namespace_tag(&self) -> String {
        self.namespace
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    /// Namespace plus separator, the prefix every rendered key starts with.
    /// Network adapters use it as the match pattern for namespace-scoped
    /// clears.
    #[must_use]
    pub fn namespace_prefix(&self) -> String {
        format!("{}{}", self.namespace, self.separator)
    }

    /// Render the tier-local key for `tier`.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when `caller_key` is empty, or when the rendered key
    /// breaks the tier's limits and `auto_hash_long_keys` is disabled.
    pub fn tier_key(&self, caller_key: &str, tier: Tier) -> CacheResult<String> {
        let composed = self.compose(caller_key, tier)?;

        let fits = composed.len() <= tier.max_key_length()
            && composed.chars().all(|c| tier.key_char_allowed(c));
        if fits {
            return Ok(composed);
        }

        if !self.auto_hash_long_keys {
            return Err(CacheError::InvalidKey(format!(
                "key exceeds limits of tier {tier} and auto-hashing is disabled"
            )));
        }

        Ok(self.hashed_form(&composed, tier))
    }

    /// Stable numeric id for a shared-memory segment, offset from `base`.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when `caller_key` is empty.
    pub fn numeric_key(&self, caller_key: &str, base: u64) -> CacheResult<u64> {
        let composed = self.compose(caller_key, Tier::Shm)?;
        let digest = self.digest(&composed);
        let mut offset_bytes = [0u8; 4];
        offset_bytes.copy_from_slice(digest.get(..4).unwrap_or(&[0, 0, 0, 0]));
        Ok(base + u64::from(u32::from_be_bytes(offset_bytes)))
    }

    /// Filesystem-safe stem for one entry of a file-backed tier. Always a
    /// fixed-length hex digest, so any caller key maps to a valid path
    /// component.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when `caller_key` is empty.
    pub fn file_stem(&self, caller_key: &str, tier: Tier) -> CacheResult<String> {
        let composed = self.compose(caller_key, tier)?;
        Ok(hex::encode(self.digest(&composed)))
    }

    fn compose(&self, caller_key: &str, tier: Tier) -> CacheResult<String> {
        if caller_key.is_empty() {
            return Err(CacheError::InvalidKey("empty key".to_string()));
        }
        let scope = self
            .scopes
            .iter()
            .find(|(t, _)| *t == tier)
            .map_or_else(|| tier.scope(), |(_, s)| s.as_str());
        Ok(format!(
            "{ns}{sep}{scope}{sep}{caller_key}",
            ns = self.namespace,
            sep = self.separator,
        ))
    }

    /// Hashed overflow form: `[namespace][sep][digest hex]` when the prefix
    /// fits, else the digest alone, truncated to the tier limit as a last
    /// resort.
    fn hashed_form(&self, composed: &str, tier: Tier) -> String {
        let digest_hex = hex::encode(self.digest(composed));
        let max = tier.max_key_length();

        let prefix = format!("{}{}", self.namespace, self.separator);
        let prefixed_ok = prefix.len() + digest_hex.len() <= max
            && prefix.chars().all(|c| tier.key_char_allowed(c));
        if prefixed_ok {
            return format!("{prefix}{digest_hex}");
        }
        if digest_hex.len() <= max {
            return digest_hex;
        }
        digest_hex.chars().take(max).collect()
    }

    fn digest(&self, input: &str) -> Vec<u8> {
        match self.algorithm {
            HashAlgorithm::Sha256 => Sha256::digest(input.as_bytes()).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(input.as_bytes()).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(input.as_bytes()).to_vec(),
        }
    }
}

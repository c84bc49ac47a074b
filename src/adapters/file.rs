//! On-disk file tier.
//!
//! One file per entry, named by the hex hash of the tier-local key with the
//! namespace tag prefixed so `clear` and the expiration sweep can enumerate
//! owned entries in a shared directory. File contents are the fixed-width
//! decimal `expires_at` followed by the payload bytes. Writes go to a
//! temporary file under an exclusive lock and are renamed into place, so
//! readers never observe a torn entry.
//!
//! The cache directory resolves through a cascade: the tier's configured
//! path, then the global cache path, then a PID-qualified default under the
//! system temp dir, then a uniquified temp dir as a last resort. If every
//! candidate is unwritable the tier reports unavailable.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::{self, Hit, TierAdapter, TierStats};
use crate::config::FileConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

const ENTRY_SUFFIX: &str = ".cache";

/// On-disk cache tier.
pub struct FileAdapter {
    keys: Arc<KeyManager>,
    config: FileConfig,
    /// Global cache path fallback, from the engine config.
    global_path: Option<PathBuf>,
    /// Directory chosen by the cascade; settled at first probe.
    dir: RwLock<Option<PathBuf>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl FileAdapter {
    /// Create the file tier. No directory is touched until the first probe.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, config: FileConfig, global_path: Option<PathBuf>) -> Self {
        Self {
            keys,
            config,
            global_path,
            dir: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// The directory currently serving this tier, if resolved.
    #[must_use]
    pub fn current_dir(&self) -> Option<PathBuf> {
        self.dir.read().clone()
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.config.path {
            candidates.push(path.clone());
        }
        if let Some(path) = &self.global_path {
            candidates.push(path.join("file"));
        }
        candidates.push(
            std::env::temp_dir().join(format!("stratacache-{}", std::process::id())),
        );
        candidates
    }

    fn prepare_dir(&self, dir: &Path) -> CacheResult<()> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(self.config.directory_permissions))?;
        }
        Self::write_test(dir)
    }

    /// The directory must actually accept entry files.
    fn write_test(dir: &Path) -> CacheResult<()> {
        let probe = dir.join(format!(".write-test-{}", std::process::id()));
        let mut file = File::create(&probe)?;
        file.write_all(b"ok")?;
        drop(file);
        fs::remove_file(&probe)?;
        Ok(())
    }

    /// Resolve the cache directory through the cascade, keeping the first
    /// writable candidate.
    fn ensure_dir(&self) -> CacheResult<PathBuf> {
        if let Some(dir) = self.dir.read().clone() {
            return Ok(dir);
        }

        let mut last_err: Option<CacheError> = None;
        for candidate in self.candidates() {
            match self.prepare_dir(&candidate) {
                Ok(()) => {
                    info!(dir = %candidate.display(), "[file] cache directory selected");
                    *self.dir.write() = Some(candidate.clone());
                    return Ok(candidate);
                }
                Err(err) => {
                    warn!(dir = %candidate.display(), error = %err, "[file] cache directory rejected");
                    last_err = Some(err);
                }
            }
        }

        // Last resort: a uniquified temp directory.
        match tempfile::Builder::new().prefix("stratacache-").tempdir() {
            Ok(tmp) => {
                let dir = tmp.keep();
                info!(dir = %dir.display(), "[file] using last-resort temp directory");
                *self.dir.write() = Some(dir.clone());
                Ok(dir)
            }
            Err(err) => Err(last_err.unwrap_or_else(|| CacheError::from_io(&err))),
        }
    }

    fn entry_path(&self, dir: &Path, key: &str) -> CacheResult<PathBuf> {
        let stem = self.keys.file_stem(key, Tier::File)?;
        Ok(dir.join(format!(
            "{tag}-{stem}{ENTRY_SUFFIX}",
            tag = self.keys.namespace_tag()
        )))
    }

    fn owned_entries(&self, dir: &Path) -> CacheResult<Vec<PathBuf>> {
        let prefix = format!("{}-", self.keys.namespace_tag());
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(ENTRY_SUFFIX) {
                entries.push(path);
            }
        }
        Ok(entries)
    }

    fn write_atomic(&self, path: &Path, blob: &[u8]) -> CacheResult<()> {
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.lock_exclusive()?;
        let outcome = file.write_all(blob).and_then(|()| file.sync_data());
        let unlock = fs2::FileExt::unlock(&file);
        drop(file);
        if let Err(err) = outcome {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        if let Err(err) = unlock {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_entry(path: &Path) -> CacheResult<Option<Vec<u8>>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        file.lock_shared()?;
        let mut blob = Vec::new();
        let outcome = (&file).read_to_end(&mut blob);
        let _ = fs2::FileExt::unlock(&file);
        outcome?;
        Ok(Some(blob))
    }
}

impl TierAdapter for FileAdapter {
    fn tier(&self) -> Tier {
        Tier::File
    }

    fn probe(&self) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        // Re-run the write test each probe; a directory can turn read-only
        // underneath a running engine.
        Self::write_test(&dir)
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let dir = self.ensure_dir()?;
        let path = self.entry_path(&dir, key)?;

        let Some(blob) = Self::read_entry(&path)? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let (expiry, payload) = adapters::decode_record(&blob)?;
        if adapters::is_stale(expiry) {
            let _ = fs::remove_file(&path);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Hit {
            value: payload.to_vec(),
            remaining_ttl: adapters::remaining_ttl(expiry),
        }))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        let path = self.entry_path(&dir, key)?;
        let blob = adapters::encode_record(adapters::expires_at(ttl), value);
        self.write_atomic(&path, &blob)?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[file] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        let path = self.entry_path(&dir, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        for path in self.owned_entries(&dir)? {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn stats(&self) -> TierStats {
        let mut entries = None;
        let mut bytes = None;
        if let Some(dir) = self.current_dir() {
            if let Ok(paths) = self.owned_entries(&dir) {
                entries = Some(paths.len() as u64);
                bytes = Some(
                    paths
                        .iter()
                        .filter_map(|p| fs::metadata(p).ok())
                        .map(|m| m.len())
                        .sum(),
                );
            }
        }
        TierStats {
            entries,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn sweep_expired(&self) -> CacheResult<u64> {
        let dir = self.ensure_dir()?;
        let mut removed = 0;
        for path in self.owned_entries(&dir)? {
            let Some(blob) = Self::read_entry(&path)? else {
                continue;
            };
            let stale = match adapters::decode_record(&blob) {
                Ok((expiry, _)) => adapters::is_stale(expiry),
                // Undecodable entries are garbage; sweep them too.
                Err(_) => true,
            };
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(count = removed, "[file] swept expired entries");
        }
        Ok(removed)
    }

    fn set_base_path(&self, path: &Path) -> CacheResult<()> {
        self.prepare_dir(path)?;
        // Entries under the old directory are abandoned, not migrated.
        *self.dir.write() = Some(path.to_path_buf());
        info!(dir = %path.display(), "[file] cache directory switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter_in(dir: &Path) -> FileAdapter {
        let config = EngineConfig::default();
        let scopes = Tier::ALL
            .into_iter()
            .map(|t| (t, config.tier_scope(t)))
            .collect();
        let keys = Arc::new(KeyManager::new(&config.keys, config.namespace(), scopes));
        FileAdapter::new(
            keys,
            FileConfig {
                path: Some(dir.to_path_buf()),
                ..FileConfig::default()
            },
            None,
        )
    }

    #[test]
    fn round_trip_with_expiry_prefix_layout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = adapter_in(tmp.path());

        file.set("user:1", b"alice", Duration::from_secs(3600))
            .expect("set");
        let hit = file.get("user:1").expect("get").expect("hit");
        assert_eq!(hit.value, b"alice");
        assert!(hit.remaining_ttl.is_some());

        // On-disk layout: ten decimal digits then the payload.
        let entries = file.owned_entries(tmp.path()).expect("entries");
        assert_eq!(entries.len(), 1);
        let blob = fs::read(&entries[0]).expect("read");
        assert!(blob[..10].iter().all(u8::is_ascii_digit));
        assert_eq!(&blob[10..], b"alice");
    }

    #[test]
    fn stale_entry_reads_as_miss_and_is_deleted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = adapter_in(tmp.path());

        file.set("old", b"v", Duration::from_secs(60)).expect("set");
        let path = file
            .entry_path(tmp.path(), "old")
            .expect("path");
        fs::write(&path, adapters::encode_record(1, b"v")).expect("backdate");

        assert!(file.get("old").expect("get").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn clear_only_touches_owned_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = adapter_in(tmp.path());

        file.set("a", b"1", Duration::from_secs(60)).expect("set");
        file.set("b", b"2", Duration::from_secs(60)).expect("set");
        let sibling = tmp.path().join("other-namespace-entry.cache");
        fs::write(&sibling, b"keep me").expect("sibling");

        file.clear().expect("clear");
        assert!(file.get("a").expect("get").is_none());
        assert!(sibling.exists());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = adapter_in(tmp.path());

        file.set("live", b"v", Duration::from_secs(3600)).expect("set");
        file.set("dead", b"v", Duration::from_secs(60)).expect("set");
        let dead_path = file.entry_path(tmp.path(), "dead").expect("path");
        fs::write(&dead_path, adapters::encode_record(1, b"v")).expect("backdate");

        assert_eq!(file.sweep_expired().expect("sweep"), 1);
        assert!(file.get("live").expect("get").is_some());
        assert!(!dead_path.exists());
    }

    #[test]
    fn delete_missing_is_ok() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = adapter_in(tmp.path());
        file.delete("never-set").expect("delete");
    }

    #[test]
    fn falls_back_to_pid_default_when_unset() {
        let config = EngineConfig::default();
        let scopes = Tier::ALL
            .into_iter()
            .map(|t| (t, config.tier_scope(t)))
            .collect();
        let keys = Arc::new(KeyManager::new(&config.keys, config.namespace(), scopes));
        let file = FileAdapter::new(keys, FileConfig::default(), None);

        file.probe().expect("probe");
        let dir = file.current_dir().expect("resolved");
        assert!(
            dir.to_string_lossy()
                .contains(&format!("stratacache-{}", std::process::id()))
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn set_base_path_switches_directory() {
        let old = tempfile::tempdir().expect("tempdir");
        let new = tempfile::tempdir().expect("tempdir");
        let file = adapter_in(old.path());

        file.set("k", b"v", Duration::from_secs(60)).expect("set");
        file.set_base_path(new.path()).expect("switch");

        // Old entries are abandoned under the previous path.
        assert!(file.get("k").expect("get").is_none());
        file.set("k", b"v2", Duration::from_secs(60)).expect("set");
        assert_eq!(
            file.get("k").expect("get").expect("hit").value,
            b"v2"
        );
        assert_eq!(file.owned_entries(new.path()).expect("entries").len(), 1);
    }
}

//! Memory-mapped file tier.
//!
//! One fixed-size file per entry under `base_path`, mapped for reads and
//! writes. The record starts with the fixed-width decimal `expires_at`,
//! then a fixed-width payload length, then the payload; the remainder of
//! the file is null padding. OS advisory locks guard each file: shared for
//! reads, exclusive for writes, released on every exit path.
//!
//! The adapter keeps an in-engine index of the entry files it owns so
//! `clear` and the expiration sweep can enumerate without scanning foreign
//! data. The index dies with the process while the files persist, so the
//! first probe runs a discovery pass over the namespace-tagged file names
//! and rehydrates it.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fs2::FileExt;
use memmap2::{Mmap, MmapMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::adapters::{self, EXPIRY_PREFIX_LEN, Hit, TierAdapter, TierStats};
use crate::config::MmapConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

const ENTRY_SUFFIX: &str = ".mmap";
const LEN_FIELD_LEN: usize = 10;
const HEADER_LEN: usize = EXPIRY_PREFIX_LEN + LEN_FIELD_LEN;

/// Memory-mapped tier.
pub struct MmapAdapter {
    keys: Arc<KeyManager>,
    config: MmapConfig,
    global_path: Option<PathBuf>,
    dir: RwLock<Option<PathBuf>>,
    /// Entry files this engine knows about; rehydrated by discovery.
    index: Mutex<HashSet<PathBuf>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl MmapAdapter {
    /// Create the mmap tier. No file is touched until the first probe.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, config: MmapConfig, global_path: Option<PathBuf>) -> Self {
        Self {
            keys,
            config,
            global_path,
            dir: RwLock::new(None),
            index: Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    fn ensure_dir(&self) -> CacheResult<PathBuf> {
        if let Some(dir) = self.dir.read().clone() {
            return Ok(dir);
        }
        let dir = self
            .config
            .base_path
            .clone()
            .or_else(|| self.global_path.as_ref().map(|p| p.join("mmap")))
            .unwrap_or_else(|| {
                std::env::temp_dir().join(format!("stratacache-{}-mmap", std::process::id()))
            });
        fs::create_dir_all(&dir)?;
        *self.dir.write() = Some(dir.clone());
        self.discover(&dir);
        Ok(dir)
    }

    /// Discovery pass: enumerate namespace-tagged entry files left by a
    /// previous process and rehydrate the index.
    fn discover(&self, dir: &Path) {
        let prefix = format!("{}-", self.keys.namespace_tag());
        let mut index = self.index.lock();
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(ENTRY_SUFFIX) {
                index.insert(path);
            }
        }
        if !index.is_empty() {
            info!(count = index.len(), "[mmap] rehydrated entry index");
        }
    }

    fn entry_path(&self, dir: &Path, key: &str) -> CacheResult<PathBuf> {
        let stem = self.keys.file_stem(key, Tier::Mmap)?;
        Ok(dir.join(format!(
            "{tag}-{stem}{ENTRY_SUFFIX}",
            tag = self.keys.namespace_tag()
        )))
    }

    fn known_files(&self) -> Vec<PathBuf> {
        self.index.lock().iter().cloned().collect()
    }

    /// Enforce `max_files` by evicting the oldest entry file.
    fn evict_for_capacity(&self, incoming: &Path) {
        let files = self.known_files();
        if files.len() < self.config.max_files || files.iter().any(|p| p == incoming) {
            return;
        }
        let oldest = files
            .into_iter()
            .filter_map(|p| fs::metadata(&p).and_then(|m| m.modified()).ok().map(|t| (t, p)))
            .min_by_key(|(t, _)| *t);
        if let Some((_, path)) = oldest {
            warn!(path = %path.display(), "[mmap] file budget reached, evicting oldest entry");
            let _ = fs::remove_file(&path);
            self.index.lock().remove(&path);
        }
    }

    fn read_record(path: &Path) -> CacheResult<Option<(u64, Vec<u8>)>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        file.lock_shared()?;
        // Safety: the shared advisory lock holds writers off while the
        // mapping is alive; the map is dropped before unlock.
        let outcome = unsafe { Mmap::map(&file) };
        let record = match outcome {
            Ok(map) => Self::parse(&map),
            Err(err) => Err(CacheError::from_io(&err)),
        };
        let _ = fs2::FileExt::unlock(&file);
        record.map(Some)
    }

    fn parse(map: &[u8]) -> CacheResult<(u64, Vec<u8>)> {
        let header = map
            .get(..HEADER_LEN)
            .ok_or_else(|| CacheError::Serialization("mapped entry shorter than header".into()))?;
        let (expiry_raw, len_raw) = header.split_at(EXPIRY_PREFIX_LEN);
        let expiry: u64 = std::str::from_utf8(expiry_raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CacheError::Serialization("bad expiry field in mapped entry".into()))?;
        let len: usize = std::str::from_utf8(len_raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CacheError::Serialization("bad length field in mapped entry".into()))?;
        let payload = map
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| CacheError::Serialization("mapped entry truncated".into()))?;
        Ok((expiry, payload.to_vec()))
    }

    fn write_record(&self, path: &Path, expiry: u64, payload: &[u8]) -> CacheResult<()> {
        let file_size = self.config.file_size_bytes as usize;
        if HEADER_LEN + payload.len() > file_size {
            return Err(CacheError::backend(format!(
                "value of {} bytes exceeds mapped file size {file_size}",
                payload.len()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        let outcome = (|| -> CacheResult<()> {
            file.set_len(self.config.file_size_bytes)?;
            // Safety: the exclusive advisory lock makes this the only
            // mapping writer; the map is flushed and dropped before unlock.
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            let header = format!("{expiry:010}{len:010}", len = payload.len());
            let end = HEADER_LEN + payload.len();
            map.get_mut(..HEADER_LEN)
                .ok_or_else(|| CacheError::backend("mapped file shorter than header"))?
                .copy_from_slice(header.as_bytes());
            map.get_mut(HEADER_LEN..end)
                .ok_or_else(|| CacheError::backend("mapped file shorter than record"))?
                .copy_from_slice(payload);
            if let Some(tail) = map.get_mut(end..) {
                tail.fill(0);
            }
            map.flush()?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        outcome
    }
}

impl TierAdapter for MmapAdapter {
    fn tier(&self) -> Tier {
        Tier::Mmap
    }

    fn probe(&self) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        let probe = dir.join(format!(".write-test-{}", std::process::id()));
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let dir = self.ensure_dir()?;
        let path = self.entry_path(&dir, key)?;
        let Some((expiry, payload)) = Self::read_record(&path)? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        if adapters::is_stale(expiry) {
            let _ = fs::remove_file(&path);
            self.index.lock().remove(&path);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Hit {
            value: payload,
            remaining_ttl: adapters::remaining_ttl(expiry),
        }))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        let path = self.entry_path(&dir, key)?;
        self.evict_for_capacity(&path);
        self.write_record(&path, adapters::expires_at(ttl), value)?;
        self.index.lock().insert(path);
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[mmap] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        let path = self.entry_path(&dir, key)?;
        self.index.lock().remove(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> CacheResult<()> {
        let dir = self.ensure_dir()?;
        self.discover(&dir);
        for path in self.known_files() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.index.lock().clear();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        let entries = self.index.lock().len() as u64;
        TierStats {
            entries: Some(entries),
            bytes: Some(entries * self.config.file_size_bytes),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn sweep_expired(&self) -> CacheResult<u64> {
        let dir = self.ensure_dir()?;
        self.discover(&dir);
        let mut removed = 0;
        for path in self.known_files() {
            let stale = match Self::read_record(&path) {
                Ok(Some((expiry, _))) => adapters::is_stale(expiry),
                Ok(None) => false,
                // Undecodable entries are garbage; sweep them too.
                Err(_) => true,
            };
            if stale && fs::remove_file(&path).is_ok() {
                self.index.lock().remove(&path);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(count = removed, "[mmap] swept expired entries");
        }
        Ok(removed)
    }

    fn set_base_path(&self, path: &Path) -> CacheResult<()> {
        let dir = path.join("mmap");
        fs::create_dir_all(&dir)?;
        // Entries under the old directory are abandoned, not migrated.
        *self.dir.write() = Some(dir.clone());
        self.index.lock().clear();
        self.discover(&dir);
        info!(dir = %dir.display(), "[mmap] base path switched");
        Ok(())
    }

    fn close(&self) {
        self.index.lock().clear();
    }
}

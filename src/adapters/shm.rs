//! Shared-memory segment tier.
//!
//! One segment per entry, addressed by a stable numeric id derived from the
//! key hash and offset from `base_numeric_key`. Segments are files under
//! the shm root (`/dev/shm` where present, so they live in memory), named
//! with the namespace tag and the hex id. Contents are the fixed-width
//! decimal `expires_at` followed by the payload; reads take a shared
//! advisory lock and writes an exclusive one.
//!
//! The in-engine index maps caller keys to segment ids for the entries this
//! process created. The segments outlive the process, so discovery
//! enumerates the namespace-tagged segment names and `clear`/sweep operate
//! on the union of both.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::adapters::{self, Hit, TierAdapter, TierStats};
use crate::config::ShmConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyManager;
use crate::tier::Tier;

const SEGMENT_SUFFIX: &str = ".seg";

/// Shared-memory tier.
pub struct ShmAdapter {
    keys: Arc<KeyManager>,
    config: ShmConfig,
    root: RwLock<Option<PathBuf>>,
    /// Caller key → segment id for entries this process created.
    index: DashMap<String, u64>,
    /// Segment ids seen on the substrate (created here or discovered).
    known: Mutex<HashSet<u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl ShmAdapter {
    /// Create the shm tier. The segment root is resolved at first probe.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>, config: ShmConfig) -> Self {
        Self {
            keys,
            config,
            root: RwLock::new(None),
            index: DashMap::new(),
            known: Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    fn ensure_root(&self) -> CacheResult<PathBuf> {
        if let Some(root) = self.root.read().clone() {
            return Ok(root);
        }
        let root = self.config.base_path.clone().unwrap_or_else(|| {
            let dev_shm = PathBuf::from("/dev/shm");
            if dev_shm.is_dir() {
                dev_shm
            } else {
                std::env::temp_dir()
            }
        });
        if !root.is_dir() {
            fs::create_dir_all(&root)?;
        }
        *self.root.write() = Some(root.clone());
        self.discover(&root);
        Ok(root)
    }

    /// Discovery pass over segments left by earlier processes.
    fn discover(&self, root: &Path) {
        let prefix = format!("{}-", self.keys.namespace_tag());
        let mut known = self.known.lock();
        let Ok(entries) = fs::read_dir(root) else {
            return;
        };
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(id_hex) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            else {
                continue;
            };
            if let Ok(id) = u64::from_str_radix(id_hex, 16) {
                known.insert(id);
            }
        }
        if !known.is_empty() {
            info!(count = known.len(), "[shm] rehydrated segment index");
        }
    }

    fn segment_path(&self, root: &Path, id: u64) -> PathBuf {
        root.join(format!(
            "{tag}-{id:012x}{SEGMENT_SUFFIX}",
            tag = self.keys.namespace_tag()
        ))
    }

    fn segment_id(&self, key: &str) -> CacheResult<u64> {
        self.keys.numeric_key(key, self.config.base_numeric_key)
    }

    fn read_segment(path: &Path) -> CacheResult<Option<Vec<u8>>> {
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

    fn write_segment(&self, path: &Path, blob: &[u8]) -> CacheResult<()> {
        if blob.len() as u64 > self.config.segment_size_bytes {
            return Err(CacheError::backend(format!(
                "record of {} bytes exceeds segment size {}",
                blob.len(),
                self.config.segment_size_bytes
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
            file.set_len(0)?;
            let mut writer = &file;
            writer.write_all(blob)?;
            file.sync_data()?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        outcome
    }

    fn remove_segment(path: &Path) -> CacheResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl TierAdapter for ShmAdapter {
    fn tier(&self) -> Tier {
        Tier::Shm
    }

    fn probe(&self) -> CacheResult<()> {
        let root = self.ensure_root()?;
        let probe = root.join(format!(
            "{}-probe-{}",
            self.keys.namespace_tag(),
            std::process::id()
        ));
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    fn get(&self, key: &str) -> CacheResult<Option<Hit>> {
        let root = self.ensure_root()?;
        let id = self.segment_id(key)?;
        let path = self.segment_path(&root, id);

        let Some(blob) = Self::read_segment(&path)? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let (expiry, payload) = adapters::decode_record(&blob)?;
        if adapters::is_stale(expiry) {
            Self::remove_segment(&path)?;
            self.known.lock().remove(&id);
            self.index.remove(key);
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
        let root = self.ensure_root()?;
        let id = self.segment_id(key)?;
        let path = self.segment_path(&root, id);
        let blob = adapters::encode_record(adapters::expires_at(ttl), value);
        self.write_segment(&path, &blob)?;
        self.index.insert(key.to_string(), id);
        self.known.lock().insert(id);
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, segment = format_args!("{id:#x}"), "[shm] cached key");
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let root = self.ensure_root()?;
        let id = self.segment_id(key)?;
        self.index.remove(key);
        self.known.lock().remove(&id);
        Self::remove_segment(&self.segment_path(&root, id))
    }

    fn clear(&self) -> CacheResult<()> {
        let root = self.ensure_root()?;
        self.discover(&root);
        let ids: Vec<u64> = self.known.lock().iter().copied().collect();
        for id in ids {
            Self::remove_segment(&self.segment_path(&root, id))?;
        }
        self.known.lock().clear();
        self.index.clear();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: Some(self.known.lock().len() as u64),
            bytes: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    fn sweep_expired(&self) -> CacheResult<u64> {
        let root = self.ensure_root()?;
        self.discover(&root);
        let ids: Vec<u64> = self.known.lock().iter().copied().collect();
        let mut removed = 0;
        for id in ids {
            let path = self.segment_path(&root, id);
            let stale = match Self::read_segment(&path)? {
                Some(blob) => match adapters::decode_record(&blob) {
                    Ok((expiry, _)) => adapters::is_stale(expiry),
                    // Undecodable segments are garbage; sweep them too.
                    Err(_) => true,
                },
                None => false,
            };
            if stale && fs::remove_file(&path).is_ok() {
                self.known.lock().remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(count = removed, "[shm] swept expired segments");
        }
        Ok(removed)
    }

    fn close(&self) {
        self.index.clear();
        self.known.lock().clear();
    }
}

//! Shared integration-test infrastructure: unique keys, temp-dir engines,
//! and small helpers for building engines over local-only tiers.

#![allow(dead_code)]

use std::path::Path;

use stratacache::{CacheEngine, CacheEngineBuilder, Tier};
use tempfile::TempDir;

/// Create a test key with a unique suffix so suites never collide.
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Engine over purely in-process tiers; no filesystem or network involved.
pub fn in_process_engine() -> CacheEngine {
    CacheEngineBuilder::new()
        .with_tiers(&[Tier::Memory, Tier::Striped, Tier::Shared])
        .build()
        .expect("in-process engine")
}

/// Engine over the file tier only, rooted in its own temp directory.
/// Returns the directory handle so it outlives the engine.
pub fn file_engine() -> (CacheEngine, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    (file_engine_at(dir.path(), "app:"), dir)
}

/// File-tier engine over an explicit directory and namespace prefix.
pub fn file_engine_at(dir: &Path, prefix: &str) -> CacheEngine {
    let mut builder = CacheEngineBuilder::new()
        .with_prefix(prefix)
        .with_tiers(&[Tier::File]);
    builder.config_mut().file.path = Some(dir.to_path_buf());
    builder.build().expect("file engine")
}

/// Engine spanning an in-process tier and the file tier, the smallest
/// hierarchy that exercises promotion and fan-out across substrates.
pub fn two_tier_engine() -> (CacheEngine, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut builder = CacheEngineBuilder::new().with_tiers(&[Tier::Memory, Tier::File]);
    builder.config_mut().file.path = Some(dir.path().to_path_buf());
    (builder.build().expect("two-tier engine"), dir)
}

/// Count the cache entry files the file tier currently owns in `dir`.
pub fn entry_file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|name| name.ends_with(".cache"))
                })
                .count()
        })
        .unwrap_or(0)
}

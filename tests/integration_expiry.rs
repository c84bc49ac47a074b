//! Integration tests for the TTL and expiration discipline: entries honor
//! their TTL on every substrate, and the sweep reclaims expired entries
//! from the tiers without native TTL.

use std::time::Duration;

use stratacache::Tier;

mod common;
use common::{entry_file_count, file_engine, in_process_engine, test_key, two_tier_engine};

#[test]
fn ttl_is_honored_across_in_process_tiers() {
    let engine = in_process_engine();
    let key = test_key("ttl_mem");

    engine.set(&key, b"v", Duration::from_secs(1)).expect("set");
    assert_eq!(engine.get(&key).expect("get"), Some(b"v".to_vec()));

    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(engine.get(&key).expect("get"), None, "entry outlived its TTL");
}

#[test]
fn ttl_is_honored_by_the_expiry_prefix_on_disk() {
    let (engine, _dir) = file_engine();
    let key = test_key("ttl_file");

    engine.set(&key, b"v", Duration::from_secs(1)).expect("set");
    assert_eq!(engine.get(&key).expect("get"), Some(b"v".to_vec()));

    // Tolerate the +1s clock granularity of the decimal prefix.
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(engine.get(&key).expect("get"), None);
}

#[test]
fn zero_ttl_means_no_expiry() {
    let (engine, _dir) = file_engine();
    let key = test_key("pinned");

    engine.set(&key, b"v", Duration::ZERO).expect("set");
    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(engine.get(&key).expect("get"), Some(b"v".to_vec()));

    // A pinned entry is also invisible to the sweep.
    assert_eq!(engine.cleanup_expired().expect("sweep"), 0);
    assert_eq!(engine.get(&key).expect("get"), Some(b"v".to_vec()));
}

#[test]
fn sweep_reclaims_every_expired_file_entry() {
    let (engine, dir) = file_engine();

    for i in 0..100 {
        engine
            .set(&format!("sweep:{i}"), b"v", Duration::from_secs(1))
            .expect("set");
    }
    assert_eq!(entry_file_count(dir.path()), 100);

    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(engine.cleanup_expired().expect("sweep"), 100);
    assert_eq!(
        entry_file_count(dir.path()),
        0,
        "sweep must leave no entry files behind"
    );
}

#[test]
fn sweep_ignores_live_entries_and_native_ttl_tiers() {
    let (engine, _dir) = two_tier_engine();
    let live = test_key("sweep_live");
    let dead = test_key("sweep_dead");

    engine.set(&live, b"v", Duration::from_secs(3600)).expect("set");
    engine.set(&dead, b"v", Duration::from_secs(1)).expect("set");

    std::thread::sleep(Duration::from_secs(2));
    // Only the file tier is swept, and only its expired entry counts; the
    // memory tier expires natively.
    assert_eq!(engine.cleanup_expired().expect("sweep"), 1);
    assert_eq!(engine.get(&live).expect("get"), Some(b"v".to_vec()));
    assert_eq!(engine.get(&dead).expect("get"), None);
}

#[test]
fn cleanup_alias_matches_cleanup_expired() {
    let (engine, _dir) = file_engine();
    let key = test_key("alias");

    engine.set(&key, b"v", Duration::from_secs(1)).expect("set");
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(engine.cleanup().expect("sweep"), 1);
    assert_eq!(engine.cleanup().expect("sweep"), 0);
}

#[test]
fn shm_and_mmap_entries_are_swept_too() {
    let shm_dir = tempfile::tempdir().expect("tempdir");
    let mmap_dir = tempfile::tempdir().expect("tempdir");
    let mut builder = stratacache::CacheEngineBuilder::new().with_tiers(&[Tier::Shm, Tier::Mmap]);
    builder.config_mut().shm.base_path = Some(shm_dir.path().to_path_buf());
    builder.config_mut().mmap.base_path = Some(mmap_dir.path().to_path_buf());
    let engine = builder.build().expect("engine");

    let key = test_key("swept");
    engine.set(&key, b"v", Duration::from_secs(1)).expect("set");
    std::thread::sleep(Duration::from_secs(2));

    // One expired record per tier.
    assert_eq!(engine.cleanup_expired().expect("sweep"), 2);
    assert_eq!(engine.get(&key).expect("get"), None);
}

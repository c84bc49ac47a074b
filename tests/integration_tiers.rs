//! Integration tests for tier-scoped and multi-tier operations, tier
//! validation, and health demotion.

use std::time::Duration;

use stratacache::{CacheEngineBuilder, CacheError, Tier};

mod common;
use common::{in_process_engine, test_key, two_tier_engine};

#[test]
fn tier_scoped_writes_stay_in_their_tier() {
    let engine = in_process_engine();
    let key = test_key("scoped");

    assert!(
        engine
            .set_to_tier(&key, b"v", Duration::from_secs(60), Tier::Shared)
            .expect("set")
    );

    assert_eq!(
        engine.get_from_tier(&key, Tier::Shared).expect("get"),
        Some(b"v".to_vec())
    );
    assert_eq!(engine.get_from_tier(&key, Tier::Memory).expect("get"), None);
    assert_eq!(engine.get_from_tier(&key, Tier::Striped).expect("get"), None);
}

#[test]
fn unconfigured_tier_is_invalid_for_scoped_calls() {
    let engine = in_process_engine();
    let key = test_key("invalid_tier");

    assert!(matches!(
        engine.get_from_tier(&key, Tier::File),
        Err(CacheError::InvalidTier(_))
    ));
    assert!(matches!(
        engine.set_to_tier(&key, b"v", Duration::from_secs(60), Tier::File),
        Err(CacheError::InvalidTier(_))
    ));
    assert!(!engine.is_tier_valid(Tier::File));
}

#[test]
fn batch_set_reports_per_tier_outcomes() {
    let engine = in_process_engine();
    let key = test_key("batch_set");

    let report = engine
        .set_to_tiers(
            &key,
            b"v",
            Duration::from_secs(60),
            &[Tier::Memory, Tier::Shared, Tier::Redis],
        )
        .expect("report");

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.successful, 2);
    assert_eq!(report.summary.failed, 1);
    assert!(report.results.get(&Tier::Memory).is_some_and(Result::is_ok));
    assert!(report.results.get(&Tier::Shared).is_some_and(Result::is_ok));
    assert!(matches!(
        report.results.get(&Tier::Redis),
        Some(Err(CacheError::InvalidTier(_)))
    ));
}

#[test]
fn batch_delete_reports_per_tier_outcomes() {
    let engine = in_process_engine();
    let key = test_key("batch_delete");

    engine.set(&key, b"v", Duration::from_secs(60)).expect("set");
    let report = engine
        .delete_from_tiers(&key, &[Tier::Memory, Tier::Striped])
        .expect("report");

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.successful, 2);
    assert_eq!(report.summary.failed, 0);
    assert_eq!(engine.get_from_tier(&key, Tier::Memory).expect("get"), None);
}

#[test]
fn preference_read_hits_the_preferred_tier_first() {
    let engine = in_process_engine();
    let key = test_key("preference");

    engine
        .set_to_tier(&key, b"shared-copy", Duration::from_secs(60), Tier::Shared)
        .expect("set");

    let value = engine
        .get_with_tier_preference(&key, Tier::Shared, false)
        .expect("get");
    assert_eq!(value, Some(b"shared-copy".to_vec()));
}

#[test]
fn preference_read_without_fallback_misses() {
    let engine = in_process_engine();
    let key = test_key("preference_no_fallback");

    engine
        .set_to_tier(&key, b"v", Duration::from_secs(60), Tier::Striped)
        .expect("set");

    // Preferred tier does not hold the key and fallback is off.
    assert_eq!(
        engine
            .get_with_tier_preference(&key, Tier::Memory, false)
            .expect("get"),
        None
    );
}

#[test]
fn preference_read_with_fallback_degenerates_to_hierarchical_get() {
    let engine = in_process_engine();
    let key = test_key("preference_fallback");

    engine
        .set_to_tier(&key, b"v", Duration::from_secs(60), Tier::Striped)
        .expect("set");

    assert_eq!(
        engine
            .get_with_tier_preference(&key, Tier::Memory, true)
            .expect("get"),
        Some(b"v".to_vec())
    );
}

#[cfg(unix)]
#[test]
fn failing_tier_is_demoted_and_skipped_by_writes() {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut builder = CacheEngineBuilder::new()
        .with_tiers(&[Tier::Striped, Tier::File])
        .with_failure_threshold(1);
    builder.config_mut().file.path = Some(dir.path().to_path_buf());
    let engine = builder.build().expect("engine");

    let key = test_key("demotion");

    // Discovery sees a writable directory.
    assert_eq!(
        engine.get_available_tiers(),
        vec![Tier::Striped, Tier::File]
    );

    // Then the directory turns read-only and the file tier starts failing.
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555)).expect("chmod");
    assert!(
        engine
            .set(&key, b"y", Duration::from_secs(60))
            .expect("set"),
        "partial success: the in-process tier accepted the write"
    );
    assert_eq!(engine.get_last_used_tier(), Some(Tier::Striped));

    // Threshold 1: the file tier is now unhealthy and scoped calls say so.
    assert!(!engine.is_tier_healthy(Tier::File));
    assert!(matches!(
        engine.get_from_tier(&key, Tier::File),
        Err(CacheError::TierUnhealthy(Tier::File))
    ));

    // Still listed as available for status reporting.
    assert!(engine.is_tier_available(Tier::File));

    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).expect("chmod back");

    // A successful probe restores the tier.
    engine.check_tier(Tier::File).expect("probe");
    assert!(engine.is_tier_healthy(Tier::File));
}

#[test]
fn check_all_tiers_reports_verdicts() {
    let engine = in_process_engine();
    let verdicts = engine.check_all_tiers();
    assert_eq!(verdicts.len(), 3);
    assert!(
        verdicts
            .iter()
            .all(|(_, v)| *v == stratacache::HealthVerdict::Healthy)
    );

    let stats = engine.get_monitoring_stats();
    assert_eq!(stats.healthy, 3);
    assert_eq!(stats.unhealthy, 0);
}

#[test]
fn tier_status_snapshot_covers_every_configured_tier() {
    let (engine, _dir) = two_tier_engine();
    engine.get(&test_key("warm")).expect("get");

    let status = engine.get_tier_status();
    assert_eq!(status.len(), 2);
    for tier_status in &status {
        assert!(tier_status.available);
        assert!(tier_status.healthy);
    }
    // Snapshot order follows priority.
    assert_eq!(status[0].tier, Tier::Memory);
    assert_eq!(status[1].tier, Tier::File);
}

#[test]
fn set_cache_path_swaps_the_file_tier_directory() {
    let (engine, _old_dir) = two_tier_engine();
    let new_dir = tempfile::tempdir().expect("tempdir");
    let key = test_key("moved");

    engine.set(&key, b"v", Duration::from_secs(3600)).expect("set");
    assert!(engine.set_cache_path(new_dir.path()).expect("switch"));
    assert_eq!(engine.get_cache_path(), Some(new_dir.path().to_path_buf()));

    // Old-path entries are abandoned for the file tier; the in-process
    // tier still serves the key.
    assert_eq!(engine.get_from_tier(&key, Tier::File).expect("get"), None);
    assert_eq!(engine.get(&key).expect("get"), Some(b"v".to_vec()));

    // New writes land under the new directory.
    let key2 = test_key("moved2");
    engine.set(&key2, b"w", Duration::from_secs(3600)).expect("set");
    assert_eq!(
        engine.get_from_tier(&key2, Tier::File).expect("get"),
        Some(b"w".to_vec())
    );
    assert!(common::entry_file_count(new_dir.path()) >= 1);
}

//! Basic usage: build an engine, write through the hierarchy, read back
//! with promotion, and inspect tier status.
//!
//! Run with: `cargo run --example basic_usage`

use std::time::Duration;

use stratacache::{CacheEngineBuilder, Tier};

fn main() -> Result<(), stratacache::CacheError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stratacache=debug")),
        )
        .init();

    // Local-only hierarchy; add Tier::Redis / Tier::Memcached when the
    // servers are reachable.
    let engine = CacheEngineBuilder::new()
        .with_prefix("demo:")
        .with_tiers(&[Tier::Memory, Tier::Striped, Tier::File])
        .build()?;

    println!("available tiers: {:?}", engine.get_available_tiers());

    // Write-through: every available tier gets a copy.
    engine.set("user:42", b"alice", Duration::from_secs(300))?;

    // Hierarchical read: served by the fastest tier that holds the key.
    if let Some(value) = engine.get("user:42")? {
        println!(
            "user:42 = {} (from {:?})",
            String::from_utf8_lossy(&value),
            engine.get_last_used_tier()
        );
    }

    // Seed only the disk tier, then watch promotion copy it upward.
    engine.set_to_tier("report:q3", b"42 pages", Duration::from_secs(300), Tier::File)?;
    engine.get("report:q3")?;
    println!(
        "after promotion, memory tier holds report:q3 = {:?}",
        engine.get_from_tier("report:q3", Tier::Memory)?.is_some()
    );

    // Compute-on-miss.
    let computed = engine.get_or_set("expensive:result", Duration::from_secs(60), || {
        println!("computing...");
        Ok(b"7x6".to_vec())
    })?;
    println!("expensive:result = {}", String::from_utf8_lossy(&computed));

    // Status and stats.
    for status in engine.get_tier_status() {
        println!(
            "tier {:<8} priority={:<3} available={} healthy={}",
            status.tier.to_string(),
            status.priority,
            status.available,
            status.healthy
        );
    }
    println!("stats: {:#?}", engine.get_stats());

    engine.close();
    Ok(())
}

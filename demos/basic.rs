//! Basic unmerge example.
//!
//! Seeds an in-memory group with 1200 events, unmerges every third
//! fingerprint into a new group, then splits a second group along its
//! hierarchical hashes.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic

use std::env;
use std::sync::Arc;
use unmerge::testing::Harness;
use unmerge::types::{Event, HashLockEntry, HashState};
use unmerge::unmerge::{
    ActivityLog, FlatReplacement, HierarchicalReplacement, InMemoryTaskStore, RunStatus,
    UnmergeTask, UnmergeWorker, DEFAULT_ACTIVITY_LIMIT,
};
use unmerge::UnmergeConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let harness = Harness::new();
    let config = UnmergeConfig::default().with_batch_size(500);
    let worker = Arc::new(UnmergeWorker::new(
        harness.runner(),
        Arc::new(InMemoryTaskStore::new()),
        config,
    )?);
    let handle = worker.start()?;

    println!("=== Flat unmerge ===");
    let matching = harness.seed_interleaved(1, 10, 1200, 3);
    let flat = UnmergeTask::initial(1, 10, FlatReplacement::new(matching), Some(1), 500);
    let summary = worker.run_to_completion(flat).await?;
    for (key, group_id) in &summary.destinations {
        println!(
            "  {key} -> group {group_id} ({} fingerprints)",
            harness.hash_locks.owned_by(1, *group_id).len()
        );
    }

    println!("\n=== Hierarchical split ===");
    harness
        .hash_locks
        .insert(HashLockEntry::new(1, "root", 20).with_state(HashState::Split));
    for i in 0..30 {
        let leaf = ["ssl", "dns", "timeout"][i % 3];
        harness.events.insert(
            Event::new(format!("h{i}"), 1, 20, "crash").with_hierarchical_hashes(["root", leaf]),
        );
    }
    let split = UnmergeTask::initial(
        1,
        20,
        HierarchicalReplacement {
            primary_hash: "crash".to_string(),
            filter_hash: "root".to_string(),
            filter_level: 0,
            new_level: 1,
            assume_source_emptied: true,
            reset_hashes: vec!["root".to_string()],
        },
        Some(1),
        8,
    );
    let run_id = worker.submit(split).await?;
    while !worker.status(run_id).is_some_and(|s| s.is_finished()) {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    if let Some(RunStatus::Completed(summary)) = worker.status(run_id) {
        for (key, group_id) in &summary.destinations {
            println!("  {key} -> group {group_id}");
        }
    }

    println!("\n=== Activity for group 20 ===");
    for record in harness
        .activity
        .activities_for_group(20, DEFAULT_ACTIVITY_LIMIT)
        .await?
    {
        println!("  -> {}: {:?}", record.destination_group_id, record.payload);
    }

    println!("\n=== Metrics ===");
    print!("{}", worker.metrics().to_prometheus());

    handle.shutdown().await;
    Ok(())
}

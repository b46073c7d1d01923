//! Fully in-memory unmerge setup with one shared fault injector.

use super::fault::FaultInjector;
use crate::metrics::UnmergeMetrics;
use crate::types::{ContentHash, Event, GroupId, HashLockEntry, ProjectId};
use crate::unmerge::memory::{
    InMemoryActivityLog, InMemoryEventSource, InMemoryGroupStore, InMemoryHashLockTable,
    InMemoryStreamSnapshots,
};
use crate::unmerge::{BatchRunner, Collaborators};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory collaborators wired to a shared [`FaultInjector`].
///
/// The concrete handles stay accessible for seeding and inspection while
/// [`runner`](Self::runner) hands the same instances to a [`BatchRunner`].
#[derive(Debug, Clone)]
pub struct Harness {
    pub faults: Arc<FaultInjector>,
    pub events: Arc<InMemoryEventSource>,
    pub hash_locks: Arc<InMemoryHashLockTable>,
    pub snapshots: Arc<InMemoryStreamSnapshots>,
    pub activity: Arc<InMemoryActivityLog>,
    pub groups: Arc<InMemoryGroupStore>,
    pub metrics: Arc<UnmergeMetrics>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Harness whose group store starts at id 1000.
    pub fn new() -> Self {
        Self::with_groups(InMemoryGroupStore::new())
    }

    /// Harness whose group store hands out `first_id` first.
    pub fn with_first_group_id(first_id: GroupId) -> Self {
        Self::with_groups(InMemoryGroupStore::starting_at(first_id))
    }

    fn with_groups(groups: InMemoryGroupStore) -> Self {
        let faults = Arc::new(FaultInjector::new());
        Self {
            events: Arc::new(InMemoryEventSource::new().with_faults(faults.clone())),
            hash_locks: Arc::new(InMemoryHashLockTable::new().with_faults(faults.clone())),
            snapshots: Arc::new(InMemoryStreamSnapshots::new().with_faults(faults.clone())),
            activity: Arc::new(InMemoryActivityLog::new().with_faults(faults.clone())),
            groups: Arc::new(groups.with_faults(faults.clone())),
            metrics: Arc::new(UnmergeMetrics::new()),
            faults,
        }
    }

    /// Trait-object view of the collaborators.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            events: self.events.clone(),
            hash_locks: self.hash_locks.clone(),
            snapshots: self.snapshots.clone(),
            activity: self.activity.clone(),
            groups: self.groups.clone(),
        }
    }

    /// Runner over these collaborators, sharing the harness metrics.
    pub fn runner(&self) -> BatchRunner {
        BatchRunner::new(self.collaborators(), self.metrics.clone())
    }

    /// Seed `total` events into `group_id`, every `match_every`-th one
    /// with its own hash `m{i}` and the rest spread over 50 shared `o*`
    /// hashes. Every hash is owned by `group_id`. Returns the `m*` hashes.
    pub fn seed_interleaved(
        &self,
        project_id: ProjectId,
        group_id: GroupId,
        total: usize,
        match_every: usize,
    ) -> Vec<ContentHash> {
        let mut matching = Vec::new();
        for i in 0..total {
            let hash = if i % match_every == 0 {
                let hash = format!("m{i}");
                matching.push(hash.clone());
                hash
            } else {
                format!("o{}", i % 50)
            };
            if self.hash_locks.entry(project_id, &hash).is_none() {
                self.hash_locks
                    .insert(HashLockEntry::new(project_id, hash.clone(), group_id));
            }
            self.events.insert(
                Event::new(format!("e{i}"), project_id, group_id, hash)
                    .with_timestamp(1_700_000_000_000 + i as u64),
            );
        }
        matching
    }
}

/// Poll `action` until `predicate` holds or `timeout` elapses.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

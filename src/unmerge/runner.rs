//! Batch runner: executes one page of an unmerge.
//!
//! A page is a pure function of its [`UnmergeTask`] plus the state of the
//! collaborators. The runner never mutates the task it was given; any
//! failure simply drops the in-progress copy of the destination map and
//! locked set, and the same task can be run again.
//!
//! # Page steps
//!
//! ```text
//!  ┌──────────────┐   ┌───────────┐   ┌────────┐   ┌────────────────────┐
//!  │ resolve lock │──▶│ fetch page│──▶│ decide │──▶│ open destinations  │
//!  └──────────────┘   └───────────┘   └────────┘   └─────────┬──────────┘
//!                                                            ▼
//!  ┌──────────────────────────┐   ┌───────────────┐   ┌─────────────────┐
//!  │ finalize or successor    │◀──│ reassign rows │◀──│ one-time reset  │
//!  └──────────────────────────┘   └───────────────┘   └─────────────────┘
//! ```
//!
//! Every write is an upsert or a conditional update, so re-running a page
//! after a partial failure converges on the same state.

use super::args::{Destination, DestinationMap, PageProgress, TaskHeader, UnmergeTask};
use super::collaborators::{
    ActivityLog, ActivityRecord, EventSource, GroupStore, HashLockStore, StreamSnapshot,
};
use crate::error::{Error, Result};
use crate::metrics::UnmergeMetrics;
use crate::types::{now_ms, ContentHash, DestinationKey, Event, GroupId, HashState, RunId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The external systems a page talks to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub events: Arc<dyn EventSource>,
    pub hash_locks: Arc<dyn HashLockStore>,
    pub snapshots: Arc<dyn StreamSnapshot>,
    pub activity: Arc<dyn ActivityLog>,
    pub groups: Arc<dyn GroupStore>,
}

/// Counts for one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    /// Events fetched.
    pub inspected: usize,
    /// Events routed to a destination.
    pub moved: usize,
    /// Events left in the source.
    pub stayed: usize,
    /// Destinations opened by this page.
    pub opened: usize,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmergeSummary {
    pub run_id: RunId,
    pub project_id: u64,
    pub source_group_id: GroupId,
    /// Destination group per key, for every destination that received
    /// events.
    pub destinations: BTreeMap<DestinationKey, GroupId>,
    /// Activity records written by the final page.
    pub activities_recorded: usize,
    /// Locked hashes returned to `Unlocked`.
    pub hashes_unlocked: usize,
}

impl UnmergeSummary {
    /// Whether the run moved anything.
    pub fn migrated(&self) -> bool {
        !self.destinations.is_empty()
    }
}

/// What a page produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// More events remain; run this task next.
    Continue(UnmergeTask),
    /// The source is exhausted.
    Complete(UnmergeSummary),
}

/// Outcome of a page together with its counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReport {
    pub stats: PageStats,
    pub outcome: PageOutcome,
}

/// Runs single pages of unmerge tasks.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    collaborators: Collaborators,
    metrics: Arc<UnmergeMetrics>,
}

impl BatchRunner {
    /// Create a runner.
    pub fn new(collaborators: Collaborators, metrics: Arc<UnmergeMetrics>) -> Self {
        Self {
            collaborators,
            metrics,
        }
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<UnmergeMetrics> {
        &self.metrics
    }

    /// Collaborators this runner writes to.
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run one page of `task`.
    ///
    /// On error nothing from this page is carried forward; the caller may
    /// run the same task again.
    pub async fn run_page(&self, task: &UnmergeTask) -> Result<PageReport> {
        task.validate()?;
        let header = task.header();
        let mut destinations = task.destinations().clone();

        // 1. Locked set: computed once, then carried.
        let (locked, mut source_fields_reset, cursor) = match task.progress() {
            Some(progress) => (
                progress.locked_hashes.clone(),
                progress.source_fields_reset,
                Some(progress.cursor.clone()),
            ),
            None => (self.lock_hashes(header).await?, false, None),
        };

        // 2. Fetch.
        let page = self
            .collaborators
            .events
            .fetch_page(
                header.project_id,
                header.source_group_id,
                cursor.as_ref(),
                header.batch_size,
            )
            .await?;
        if page.events.is_empty() {
            if let Some(next_cursor) = &page.next_cursor {
                return Err(Error::Invariant(format!(
                    "event source returned an empty page with cursor {next_cursor:?} for group {}",
                    header.source_group_id
                )));
            }
        }

        // 3. Decide.
        let mut moves: BTreeMap<DestinationKey, Vec<&Event>> = BTreeMap::new();
        let mut stats = PageStats {
            inspected: page.events.len(),
            ..PageStats::default()
        };
        for event in &page.events {
            match header.replacement.decide(event, &locked) {
                Some(key) => moves.entry(key).or_default().push(event),
                None => stats.stayed += 1,
            }
        }
        stats.moved = stats.inspected - stats.stayed;

        // 4. Open destinations for keys seen for the first time.
        for key in moves.keys() {
            if self.open_destination(header, &mut destinations, key).await? {
                stats.opened += 1;
            }
        }

        // 5. One-time reset of the source's denormalized fields.
        if stats.stayed > 0 && !source_fields_reset {
            self.collaborators
                .groups
                .reset_source_fields(header.project_id, header.source_group_id)
                .await?;
            source_fields_reset = true;
            tracing::debug!(
                run_id = %header.run_id,
                source_group_id = header.source_group_id,
                "Reset source group fields"
            );
        }

        // 6. Reassign hash rows of every key that moved events.
        for (key, events) in &moves {
            let destination = destinations.get(key).ok_or_else(|| {
                Error::Internal(format!("destination {key:?} missing after open"))
            })?;
            header
                .replacement
                .apply_row_reassignment(
                    self.collaborators.hash_locks.as_ref(),
                    header.project_id,
                    key,
                    destination.group_id,
                    &locked,
                )
                .await?;
            tracing::debug!(
                run_id = %header.run_id,
                destination_key = %key,
                destination_group_id = destination.group_id,
                events = events.len(),
                "Reassigned rows"
            );
        }

        // 7. Finalize or hand over to the next page.
        let outcome = match page.next_cursor {
            None => PageOutcome::Complete(self.finalize(header, &destinations, &locked).await?),
            Some(next_cursor) => {
                let next = UnmergeTask::successor(
                    header.clone(),
                    destinations,
                    PageProgress {
                        cursor: next_cursor,
                        locked_hashes: locked,
                        source_fields_reset,
                    },
                );
                if task.is_initial() && !next.is_initial() {
                    tracing::info!(
                        run_id = %header.run_id,
                        project_id = header.project_id,
                        source_group_id = header.source_group_id,
                        destinations = next.destinations().len(),
                        "Unmerge entered successive phase"
                    );
                }
                PageOutcome::Continue(next)
            }
        };

        self.metrics
            .record_page(stats.inspected as u64, stats.moved as u64);
        self.metrics.destinations_created.inc_by(stats.opened as u64);

        tracing::debug!(
            run_id = %header.run_id,
            phase = task.phase(),
            inspected = stats.inspected,
            moved = stats.moved,
            stayed = stats.stayed,
            complete = matches!(outcome, PageOutcome::Complete(_)),
            "Page processed"
        );

        Ok(PageReport { stats, outcome })
    }

    async fn lock_hashes(&self, header: &TaskHeader) -> Result<BTreeSet<ContentHash>> {
        let hashes = header.replacement.hashes_to_lock();
        if hashes.is_empty() {
            return Ok(BTreeSet::new());
        }
        let locked = self
            .collaborators
            .hash_locks
            .lock_hashes(header.project_id, header.source_group_id, &hashes)
            .await?;
        tracing::debug!(
            run_id = %header.run_id,
            requested = hashes.len(),
            locked = locked.len(),
            "Locked hashes for migration"
        );
        Ok(locked)
    }

    /// Make sure `key` has a destination with an open stream. Returns
    /// whether a stream was opened.
    async fn open_destination(
        &self,
        header: &TaskHeader,
        destinations: &mut DestinationMap,
        key: &DestinationKey,
    ) -> Result<bool> {
        let group_id = match destinations.get(key) {
            Some(destination) if destination.is_open() => return Ok(false),
            Some(destination) => destination.group_id,
            None => {
                self.collaborators
                    .groups
                    .create_destination(
                        header.project_id,
                        header.source_group_id,
                        header.run_id,
                        key,
                    )
                    .await?
            }
        };

        if group_id == header.source_group_id {
            return Err(Error::Invariant(format!(
                "destination {key:?} resolved to the source group {group_id}"
            )));
        }
        if let Some((other, _)) = destinations
            .iter()
            .find(|(k, d)| *k != key && d.group_id == group_id)
        {
            return Err(Error::Invariant(format!(
                "group {group_id} already receives events for key {other:?}, not {key:?}"
            )));
        }

        let stream = header
            .replacement
            .begin_destination_stream(
                self.collaborators.snapshots.as_ref(),
                header.project_id,
                key,
                header.source_group_id,
                group_id,
            )
            .await?;
        destinations.insert(
            key.clone(),
            Destination {
                group_id,
                stream: Some(stream),
            },
        );

        tracing::info!(
            run_id = %header.run_id,
            project_id = header.project_id,
            source_group_id = header.source_group_id,
            destination_key = %key,
            destination_group_id = group_id,
            "Opened destination"
        );
        Ok(true)
    }

    /// Close streams, write activities, release locks and run the
    /// replacement's completion hook. Safe to repeat.
    async fn finalize(
        &self,
        header: &TaskHeader,
        destinations: &DestinationMap,
        locked: &BTreeSet<ContentHash>,
    ) -> Result<UnmergeSummary> {
        let project_id = header.project_id;
        let mut opened = BTreeMap::new();

        for (key, destination) in destinations {
            let Some(stream) = &destination.stream else {
                continue;
            };
            header
                .replacement
                .end_destination_stream(self.collaborators.snapshots.as_ref(), stream)
                .await?;
            self.metrics.streams_closed.inc();
            opened.insert(key.clone(), destination.group_id);
        }

        for (key, group_id) in &opened {
            self.collaborators
                .activity
                .record(ActivityRecord {
                    project_id,
                    source_group_id: header.source_group_id,
                    destination_group_id: *group_id,
                    actor_id: header.actor_id,
                    payload: header.replacement.activity_payload(key),
                    created_at_ms: now_ms(),
                })
                .await?;
            self.metrics.activities_recorded.inc();
        }

        let hashes_unlocked = if locked.is_empty() {
            0
        } else {
            let hashes: Vec<ContentHash> = locked.iter().cloned().collect();
            self.collaborators
                .hash_locks
                .unlock(project_id, &hashes, HashState::LockedForMigration)
                .await?
        };

        header
            .replacement
            .on_complete(
                self.collaborators.snapshots.as_ref(),
                project_id,
                header.source_group_id,
            )
            .await?;

        tracing::info!(
            run_id = %header.run_id,
            project_id,
            source_group_id = header.source_group_id,
            replacement = header.replacement.kind(),
            destinations = opened.len(),
            hashes_unlocked,
            "Unmerge complete"
        );

        Ok(UnmergeSummary {
            run_id: header.run_id,
            project_id,
            source_group_id: header.source_group_id,
            activities_recorded: opened.len(),
            destinations: opened,
            hashes_unlocked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FaultAction, Harness};
    use crate::types::{Cursor, HashLockEntry, ProjectId, DEFAULT_UNMERGE_KEY};
    use crate::unmerge::collaborators::EventPage;
    use crate::unmerge::replacement::{FlatReplacement, HierarchicalReplacement};
    use async_trait::async_trait;

    /// Event source that never advances.
    #[derive(Debug)]
    struct StalledEventSource;

    #[async_trait]
    impl EventSource for StalledEventSource {
        async fn fetch_page(
            &self,
            _project_id: ProjectId,
            _group_id: GroupId,
            cursor: Option<&Cursor>,
            _limit: usize,
        ) -> Result<EventPage> {
            Ok(EventPage {
                events: Vec::new(),
                next_cursor: Some(cursor.cloned().unwrap_or_else(|| Cursor::new("0"))),
            })
        }
    }

    fn flat_task(batch_size: usize) -> UnmergeTask {
        UnmergeTask::initial(1, 10, FlatReplacement::new(["a"]), Some(7), batch_size)
    }

    fn seed_flat(harness: &Harness, matching: usize, other: usize) {
        harness
            .hash_locks
            .insert(HashLockEntry::new(1, "a", 10));
        harness
            .hash_locks
            .insert(HashLockEntry::new(1, "b", 10));
        for i in 0..matching {
            harness.events.insert(Event::new(format!("a{i}"), 1, 10, "a"));
        }
        for i in 0..other {
            harness.events.insert(Event::new(format!("b{i}"), 1, 10, "b"));
        }
    }

    fn expect_continue(report: PageReport) -> UnmergeTask {
        match report.outcome {
            PageOutcome::Continue(next) => next,
            PageOutcome::Complete(summary) => panic!("unexpected completion: {summary:?}"),
        }
    }

    fn expect_complete(report: PageReport) -> UnmergeSummary {
        match report.outcome {
            PageOutcome::Complete(summary) => summary,
            PageOutcome::Continue(next) => panic!("unexpected successor: {next:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_match_enters_successive() {
        let harness = Harness::new();
        seed_flat(&harness, 2, 3);
        let runner = harness.runner();

        let report = runner.run_page(&flat_task(3)).await.unwrap();
        assert_eq!(report.stats.moved, 2);
        assert_eq!(report.stats.stayed, 1);
        assert_eq!(report.stats.opened, 1);

        let next = expect_continue(report);
        assert!(!next.is_initial());
        let destination = &next.destinations()[DEFAULT_UNMERGE_KEY];
        assert!(destination.is_open());
        assert_eq!(
            harness.hash_locks.entry(1, "a").unwrap().group_id,
            destination.group_id
        );
        assert_eq!(
            harness.hash_locks.entry(1, "a").unwrap().state,
            HashState::LockedForMigration
        );
        assert!(next.source_fields_reset());
    }

    #[tokio::test]
    async fn test_zero_matches_terminate_from_initial() {
        let harness = Harness::new();
        seed_flat(&harness, 0, 5);
        let runner = harness.runner();

        let mut task = flat_task(2);
        let summary = loop {
            let report = runner.run_page(&task).await.unwrap();
            match report.outcome {
                PageOutcome::Continue(next) => {
                    assert!(next.is_initial());
                    task = next;
                }
                PageOutcome::Complete(summary) => break summary,
            }
        };

        assert!(!summary.migrated());
        assert_eq!(harness.snapshots.begun_count(), 0);
        assert!(harness.activity.records().is_empty());
        assert_eq!(harness.groups.created_count(), 0);
        // The unused lock is released.
        assert_eq!(harness.hash_locks.entry(1, "a").unwrap().state, HashState::Unlocked);
        assert_eq!(harness.groups.reset_count(1, 10), 1);
    }

    #[tokio::test]
    async fn test_empty_source_completes_immediately() {
        let harness = Harness::new();
        harness.hash_locks.insert(HashLockEntry::new(1, "a", 10));

        let summary = expect_complete(harness.runner().run_page(&flat_task(5)).await.unwrap());
        assert!(!summary.migrated());
        assert_eq!(summary.hashes_unlocked, 1);
        assert_eq!(harness.groups.reset_count(1, 10), 0);
    }

    #[tokio::test]
    async fn test_reset_happens_once() {
        let harness = Harness::new();
        seed_flat(&harness, 0, 6);
        let runner = harness.runner();

        let mut task = flat_task(2);
        while let PageOutcome::Continue(next) = runner.run_page(&task).await.unwrap().outcome {
            task = next;
        }
        assert_eq!(harness.groups.reset_count(1, 10), 1);
    }

    #[tokio::test]
    async fn test_failed_page_can_be_rerun() {
        let harness = Harness::new();
        seed_flat(&harness, 3, 0);
        let runner = harness.runner();
        let task = flat_task(10);

        harness
            .faults
            .enable("hash_locks.reassign", FaultAction::FailTimes(1));
        let err = runner.run_page(&task).await.unwrap_err();
        assert!(err.is_retryable());

        let summary = expect_complete(runner.run_page(&task).await.unwrap());
        assert_eq!(summary.destinations.len(), 1);
        // The retry reused the group and stream opened by the failed attempt.
        assert_eq!(harness.groups.created_count(), 1);
        assert_eq!(harness.snapshots.begun_count(), 1);
        assert_eq!(harness.activity.records().len(), 1);
    }

    #[tokio::test]
    async fn test_final_page_rerun_is_harmless() {
        let harness = Harness::new();
        seed_flat(&harness, 3, 1);
        let runner = harness.runner();

        let last = expect_continue(runner.run_page(&flat_task(2)).await.unwrap());
        let first = expect_complete(runner.run_page(&last).await.unwrap());
        let second = expect_complete(runner.run_page(&last).await.unwrap());

        assert_eq!(first.destinations, second.destinations);
        assert_eq!(harness.activity.records().len(), 1);
        assert_eq!(harness.snapshots.open_count(), 0);
        assert_eq!(first.hashes_unlocked, 1);
        assert_eq!(second.hashes_unlocked, 0);
    }

    #[tokio::test]
    async fn test_caller_supplied_destination_is_used() {
        let harness = Harness::new();
        seed_flat(&harness, 2, 0);

        let task = flat_task(10).with_destination(DEFAULT_UNMERGE_KEY, 55);
        let summary = expect_complete(harness.runner().run_page(&task).await.unwrap());

        assert_eq!(summary.destinations[DEFAULT_UNMERGE_KEY], 55);
        assert_eq!(harness.groups.created_count(), 0);
        assert_eq!(harness.hash_locks.entry(1, "a").unwrap().group_id, 55);
    }

    #[tokio::test]
    async fn test_destination_shared_by_two_keys_is_invariant_error() {
        // The group store hands out 50 next, which is already the
        // caller-supplied destination of "x".
        let harness = Harness::with_first_group_id(50);
        harness
            .events
            .insert(Event::new("e1", 1, 10, "p").with_hierarchical_hashes(["a", "x"]));
        harness
            .events
            .insert(Event::new("e2", 1, 10, "p").with_hierarchical_hashes(["a", "y"]));

        let replacement = HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "a".to_string(),
            filter_level: 0,
            new_level: 1,
            assume_source_emptied: false,
            reset_hashes: Vec::new(),
        };
        let task = UnmergeTask::initial(1, 10, replacement, None, 10).with_destination("x", 50);

        let err = harness.runner().run_page(&task).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_destination_equal_to_source_is_invariant_error() {
        let harness = Harness::with_first_group_id(10);
        seed_flat(&harness, 1, 0);

        let err = harness.runner().run_page(&flat_task(10)).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn test_hierarchical_opens_one_destination_per_key() {
        let harness = Harness::new();
        harness
            .hash_locks
            .insert(HashLockEntry::new(1, "a", 10).with_state(HashState::Split));
        for (i, leaf) in ["x", "y", "x", "z"].iter().enumerate() {
            harness.events.insert(
                Event::new(format!("e{i}"), 1, 10, "p").with_hierarchical_hashes(["a", *leaf]),
            );
        }
        harness
            .events
            .insert(Event::new("other", 1, 10, "q").with_hierarchical_hashes(["a", "x"]));

        let replacement = HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "a".to_string(),
            filter_level: 0,
            new_level: 1,
            assume_source_emptied: true,
            reset_hashes: vec!["a".to_string()],
        };
        let task = UnmergeTask::initial(1, 10, replacement, Some(3), 100);
        let summary = expect_complete(harness.runner().run_page(&task).await.unwrap());

        let keys: Vec<_> = summary.destinations.keys().cloned().collect();
        assert_eq!(keys, vec!["x", "y", "z"]);
        assert_eq!(harness.activity.records().len(), 3);
        assert_eq!(harness.snapshots.closed_count(), 3);
        assert!(harness.snapshots.is_excluded(1, 10));
        assert_eq!(harness.hash_locks.entry(1, "a").unwrap().state, HashState::Unlocked);
        for (key, group_id) in &summary.destinations {
            assert_eq!(harness.hash_locks.entry(1, key).unwrap().group_id, *group_id);
        }
    }

    #[tokio::test]
    async fn test_metrics_follow_pages() {
        let harness = Harness::new();
        seed_flat(&harness, 4, 4);
        let runner = harness.runner();

        let mut task = flat_task(3);
        while let PageOutcome::Continue(next) = runner.run_page(&task).await.unwrap().outcome {
            task = next;
        }

        let snapshot = runner.metrics().snapshot();
        assert_eq!(snapshot.pages_processed, 3);
        assert_eq!(snapshot.events_inspected, 8);
        assert_eq!(snapshot.events_moved, 4);
        assert_eq!(snapshot.destinations_created, 1);
        assert_eq!(snapshot.streams_closed, 1);
        assert_eq!(snapshot.activities_recorded, 1);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let harness = Harness::new();
        seed_flat(&harness, 2, 2);

        let err = harness.runner().run_page(&flat_task(0)).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(!err.is_retryable());
        // Nothing was locked or fetched.
        assert_eq!(harness.hash_locks.entry(1, "a").unwrap().state, HashState::Unlocked);
        assert_eq!(harness.metrics.snapshot().pages_processed, 0);
    }

    #[tokio::test]
    async fn test_empty_page_with_cursor_is_invariant_error() {
        let harness = Harness::new();
        let mut collaborators = harness.collaborators();
        collaborators.events = Arc::new(StalledEventSource);
        let runner = BatchRunner::new(collaborators, harness.metrics.clone());

        let err = runner.run_page(&flat_task(5)).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_reset_on_first_page_with_stays() {
        let harness = Harness::new();
        // Page 1: a0, a1 (both move). Page 2: b0, b1. Page 3: b2.
        seed_flat(&harness, 2, 3);
        let runner = harness.runner();

        let second = expect_continue(runner.run_page(&flat_task(2)).await.unwrap());
        assert!(!second.is_initial());
        assert!(!second.source_fields_reset());
        assert_eq!(harness.groups.reset_count(1, 10), 0);

        let third = expect_continue(runner.run_page(&second).await.unwrap());
        assert!(third.source_fields_reset());
        assert_eq!(harness.groups.reset_count(1, 10), 1);

        expect_complete(runner.run_page(&third).await.unwrap());
        assert_eq!(harness.groups.reset_count(1, 10), 1);
    }

    #[tokio::test]
    async fn test_on_complete_runs_without_destinations() {
        let harness = Harness::new();
        harness
            .events
            .insert(Event::new("e0", 1, 10, "q").with_hierarchical_hashes(["a", "x"]));

        let replacement = HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "a".to_string(),
            filter_level: 0,
            new_level: 1,
            assume_source_emptied: true,
            reset_hashes: Vec::new(),
        };
        let task = UnmergeTask::initial(1, 10, replacement, None, 10);
        let summary = expect_complete(harness.runner().run_page(&task).await.unwrap());

        assert!(!summary.migrated());
        assert!(harness.snapshots.is_excluded(1, 10));
    }
}

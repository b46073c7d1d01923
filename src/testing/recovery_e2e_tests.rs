//! Crash and resume scenarios for unmerge runs.
//!
//! A "crash" drops the worker between two steps of a run; a fresh worker
//! over the same task store and collaborators must finish the run with
//! the same result as an uninterrupted one.

use crate::config::UnmergeConfig;
use crate::testing::{wait_for_result, FaultAction, Harness};
use crate::types::{RunId, DEFAULT_UNMERGE_KEY};
use crate::unmerge::{
    FileTaskStore, FlatReplacement, InMemoryTaskStore, PageOutcome, RunStatus, TaskStore,
    UnmergeTask, UnmergeWorker,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_log::test;
use tracing::info;

const PROJECT: u64 = 1;
const SOURCE: u64 = 10;

fn config() -> UnmergeConfig {
    UnmergeConfig::new()
        .with_max_page_retries(1)
        .with_retry_backoff(Duration::from_millis(1))
}

fn worker(harness: &Harness, store: Arc<dyn TaskStore>) -> Arc<UnmergeWorker> {
    Arc::new(UnmergeWorker::new(harness.runner(), store, config()).unwrap())
}

async fn wait_finished(worker: &UnmergeWorker, run_id: RunId) -> RunStatus {
    wait_for_result(
        move || async move { worker.status(run_id) },
        |status| status.as_ref().is_some_and(RunStatus::is_finished),
        Duration::from_secs(5),
    )
    .await
    .flatten()
    .unwrap_or_else(|| panic!("run {run_id} did not finish"))
}

#[test(tokio::test)]
async fn test_resume_between_pages_from_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let matching = harness.seed_interleaved(PROJECT, SOURCE, 1200, 3);
    let task = UnmergeTask::initial(PROJECT, SOURCE, FlatReplacement::new(matching), None, 500);
    let run_id = task.run_id();

    // First process: run one page, persist the successor, then crash.
    {
        let store = FileTaskStore::new(temp_dir.path()).await.unwrap();
        store.save(&task).await.unwrap();
        let PageOutcome::Continue(next) = harness.runner().run_page(&task).await.unwrap().outcome
        else {
            panic!("first page completed early");
        };
        store.save(&next).await.unwrap();
        info!(run_id = %run_id, "Simulated crash after page 1");
    }

    // Second process resumes from disk.
    let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(temp_dir.path()).await.unwrap());
    let worker = worker(&harness, store.clone());
    let handle = worker.start().unwrap();
    assert_eq!(worker.resume_pending().await.unwrap(), 1);

    let RunStatus::Completed(summary) = wait_finished(&worker, run_id).await else {
        panic!("resumed run failed");
    };
    handle.shutdown().await;

    let destination = summary.destinations[DEFAULT_UNMERGE_KEY];
    assert_eq!(harness.hash_locks.owned_by(PROJECT, destination).len(), 400);
    assert_eq!(harness.groups.created_count(), 1);
    assert_eq!(harness.snapshots.begun_count(), 1);
    assert_eq!(harness.activity.records().len(), 1);
    assert_eq!(harness.metrics.snapshot().events_inspected, 1200);
    assert!(store.load_pending().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_crash_after_final_page_before_ack() {
    let harness = Harness::new();
    let matching = harness.seed_interleaved(PROJECT, SOURCE, 90, 3);
    let store = Arc::new(InMemoryTaskStore::new());

    // Drive the run by hand up to and including the final page, but never
    // remove it from the store.
    let runner = harness.runner();
    let mut task = UnmergeTask::initial(PROJECT, SOURCE, FlatReplacement::new(matching), None, 40);
    store.save(&task).await.unwrap();
    let first = loop {
        match runner.run_page(&task).await.unwrap().outcome {
            PageOutcome::Continue(next) => {
                store.save(&next).await.unwrap();
                task = next;
            }
            PageOutcome::Complete(summary) => break summary,
        }
    };

    // The restarted worker runs the final page again.
    let worker = worker(&harness, store.clone());
    let handle = worker.start().unwrap();
    assert_eq!(worker.resume_pending().await.unwrap(), 1);
    let RunStatus::Completed(second) = wait_finished(&worker, task.run_id()).await else {
        panic!("re-run of final page failed");
    };
    handle.shutdown().await;

    assert_eq!(first.destinations, second.destinations);
    assert_eq!(harness.activity.records().len(), 1);
    assert_eq!(harness.snapshots.closed_count(), 1);
    assert_eq!(store.archived().len(), 1);
    assert!(store.load_pending().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_failed_run_resumes_after_outage() {
    let harness = Harness::new();
    let matching = harness.seed_interleaved(PROJECT, SOURCE, 60, 3);
    let store = Arc::new(InMemoryTaskStore::new());
    harness.faults.enable("stream.end", FaultAction::Fail);

    let worker = worker(&harness, store.clone());
    let handle = worker.start().unwrap();
    let task = UnmergeTask::initial(PROJECT, SOURCE, FlatReplacement::new(matching), None, 25);
    let run_id = worker.submit(task).await.unwrap();

    assert!(matches!(
        wait_finished(&worker, run_id).await,
        RunStatus::Failed(_)
    ));
    assert!(store.load(run_id).await.unwrap().is_some());

    // The outage clears; the pending final page is picked up again.
    harness.faults.disable_all();
    assert_eq!(worker.resume_pending().await.unwrap(), 1);
    let status = wait_finished(&worker, run_id).await;
    handle.shutdown().await;

    let RunStatus::Completed(summary) = status else {
        panic!("resumed run did not complete: {status:?}");
    };
    let destination = summary.destinations[DEFAULT_UNMERGE_KEY];
    assert_eq!(harness.hash_locks.owned_by(PROJECT, destination).len(), 20);
    assert_eq!(harness.groups.created_count(), 1);

    let metrics = harness.metrics.snapshot();
    assert_eq!(metrics.runs_failed, 1);
    assert_eq!(metrics.runs_completed, 1);
    assert_eq!(metrics.active_runs, 0);
}

#[test(tokio::test)]
async fn test_worker_drains_queued_runs() {
    let harness = Harness::new();
    let matching = harness.seed_interleaved(PROJECT, SOURCE, 300, 3);
    let worker = worker(&harness, Arc::new(InMemoryTaskStore::new()));
    let handle = worker.start().unwrap();

    let (left, right) = matching.split_at(50);
    let first = worker
        .submit(UnmergeTask::initial(PROJECT, SOURCE, FlatReplacement::new(left.to_vec()), None, 64))
        .await
        .unwrap();
    let second = worker
        .submit(UnmergeTask::initial(PROJECT, SOURCE, FlatReplacement::new(right.to_vec()), None, 64))
        .await
        .unwrap();

    let RunStatus::Completed(a) = wait_finished(&worker, first).await else {
        panic!("first run failed");
    };
    let RunStatus::Completed(b) = wait_finished(&worker, second).await else {
        panic!("second run failed");
    };
    handle.shutdown().await;

    assert_ne!(
        a.destinations[DEFAULT_UNMERGE_KEY],
        b.destinations[DEFAULT_UNMERGE_KEY]
    );
    assert_eq!(
        harness
            .hash_locks
            .owned_by(PROJECT, a.destinations[DEFAULT_UNMERGE_KEY])
            .len(),
        50
    );
    assert_eq!(
        harness
            .hash_locks
            .owned_by(PROJECT, b.destinations[DEFAULT_UNMERGE_KEY])
            .len(),
        50
    );
    assert_eq!(harness.metrics.snapshot().runs_completed, 2);
}

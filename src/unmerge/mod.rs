//! Resumable group unmerge.
//!
//! Splitting a group moves some of its events into one or more new groups.
//! Groups can hold millions of events, so the work is cut into pages that
//! run as independent queue tasks. Each page carries everything the next
//! one needs ([`UnmergeTask`]); nothing else survives between pages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         UnmergeWorker                            │
//! │   submit ──▶ queue ──▶ run_to_completion ──▶ TaskStore (save)    │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ one page
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          BatchRunner                             │
//! │   ReplacementSpec::decide  ──▶  destinations  ──▶  row writes    │
//! └──┬──────────────┬───────────────┬──────────────┬──────────────┬──┘
//!    ▼              ▼               ▼              ▼              ▼
//! EventSource  HashLockStore  StreamSnapshot   ActivityLog    GroupStore
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use unmerge::metrics::UnmergeMetrics;
//! use unmerge::unmerge::memory::*;
//! use unmerge::unmerge::{BatchRunner, Collaborators, FlatReplacement, PageOutcome, UnmergeTask};
//! use unmerge::{Event, HashLockEntry};
//!
//! # tokio_test_block_on(async {
//! let events = Arc::new(InMemoryEventSource::new());
//! let hash_locks = Arc::new(InMemoryHashLockTable::new());
//! hash_locks.insert(HashLockEntry::new(1, "a", 10));
//! events.insert(Event::new("e1", 1, 10, "a"));
//! events.insert(Event::new("e2", 1, 10, "b"));
//!
//! let runner = BatchRunner::new(
//!     Collaborators {
//!         events,
//!         hash_locks: hash_locks.clone(),
//!         snapshots: Arc::new(InMemoryStreamSnapshots::new()),
//!         activity: Arc::new(InMemoryActivityLog::new()),
//!         groups: Arc::new(InMemoryGroupStore::new()),
//!     },
//!     Arc::new(UnmergeMetrics::new()),
//! );
//!
//! let task = UnmergeTask::initial(1, 10, FlatReplacement::new(["a"]), None, 500);
//! let report = runner.run_page(&task).await.unwrap();
//! let PageOutcome::Complete(summary) = report.outcome else { panic!() };
//! assert_eq!(hash_locks.entry(1, "a").unwrap().group_id, summary.destinations["default"]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod args;
pub mod collaborators;
pub mod memory;
pub mod replacement;
pub mod runner;
pub mod task_store;
pub mod worker;

pub use args::{
    Destination, DestinationMap, InitialPage, PageProgress, SuccessivePage, TaskDescriptor,
    TaskHeader, UnmergeTask,
};
pub use collaborators::{
    ActivityLog, ActivityPayload, ActivityRecord, EventPage, EventSource, GroupStore,
    HashLockStore, StreamCriteria, StreamSnapshot, StreamState, DEFAULT_ACTIVITY_LIMIT,
};
pub use replacement::{FlatReplacement, HierarchicalReplacement, ReplacementSpec};
pub use runner::{BatchRunner, Collaborators, PageOutcome, PageReport, PageStats, UnmergeSummary};
pub use task_store::{FileTaskStore, InMemoryTaskStore, TaskStore};
pub use worker::{RunStatus, UnmergeWorker, WorkerHandle};

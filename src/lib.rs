//! Resumable group unmerge engine.
//!
//! Splits the events of one group into one or more new groups, page by
//! page, so that arbitrarily large groups can be split by short queue
//! tasks that survive crashes and retries.
//!
//! # Features
//!
//! - Flat unmerge: move a fixed set of fingerprints into one new group
//! - Hierarchical split: fan one fingerprint out by a deeper level of its
//!   hierarchical hashes, one new group per distinct hash
//! - Explicit page state machine (`Initial` → `Successive` → terminal)
//!   carried as an immutable, serializable task
//! - Idempotent pages: every collaborator write is an upsert or a
//!   conditional update, so any page can be re-run after a failure
//! - Durable task store and a queue-driven worker with bounded retries
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unmerge::testing::Harness;
//! use unmerge::unmerge::{FlatReplacement, InMemoryTaskStore, UnmergeTask, UnmergeWorker};
//! use unmerge::UnmergeConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // In-memory collaborators; production wires real stores instead.
//!     let harness = Harness::new();
//!     let matching = harness.seed_interleaved(1, 10, 1200, 3);
//!
//!     let worker = UnmergeWorker::new(
//!         harness.runner(),
//!         Arc::new(InMemoryTaskStore::new()),
//!         UnmergeConfig::default(),
//!     )?;
//!
//!     let task = UnmergeTask::initial(1, 10, FlatReplacement::new(matching), None, 500);
//!     let summary = worker.run_to_completion(task).await?;
//!     println!("moved into {:?}", summary.destinations);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Caller (API handler, scheduler)      │
//! └─────────────────────────────────────────────┘
//!                     │ TaskDescriptor / UnmergeTask
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │              UnmergeWorker                  │
//! │  • submit(task) -> RunId                    │
//! │  • resume_pending()                         │
//! └─────────────────────────────────────────────┘
//!                     │ one page at a time
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │               BatchRunner                   │
//! │  ReplacementSpec decides, runner writes     │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌──────────┬────┴─────┬───────────┐
//!     ▼          ▼          ▼           ▼
//! ┌────────┐ ┌────────┐ ┌────────┐ ┌──────────┐
//! │ Events │ │ Hashes │ │ Stream │ │ Activity │
//! └────────┘ └────────┘ └────────┘ └──────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Hash ownership**: the hash lock table is the source of truth for
//!   which group owns a fingerprint; rows move by upsert.
//! - **Pages**: at-least-once. A page that fails part way is re-run from
//!   the same task and converges on the same state.
//! - **Runs**: no two pages of the same run execute concurrently.

pub mod config;
pub mod error;
pub mod metrics;
pub mod testing;
pub mod types;
pub mod unmerge;

// Re-export main types for convenience
pub use config::{UnmergeConfig, DEFAULT_BATCH_SIZE};
pub use error::{Error, Result, StoreError};
pub use types::{
    ActorId, ContentHash, Cursor, DestinationKey, Event, GroupId, HashLockEntry, HashState,
    ProjectId, RunId, DEFAULT_UNMERGE_KEY,
};

// Re-export unmerge types
pub use unmerge::{
    BatchRunner, Collaborators, FlatReplacement, HierarchicalReplacement, PageOutcome,
    ReplacementSpec, TaskDescriptor, UnmergeSummary, UnmergeTask, UnmergeWorker,
};

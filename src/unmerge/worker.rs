//! Queue-driven worker that runs unmerges page by page.
//!
//! Runs are queued and drained in FIFO order by a single background loop.
//! New submissions are refused once `queue_capacity` runs are waiting;
//! runs resumed from the task store are always queued. For each run the worker executes pages until
//! the source is exhausted, persisting every successor task before moving
//! on, so a crash loses at most the page in flight. That page is simply run
//! again by [`UnmergeWorker::resume_pending`].
//!
//! Retryable page failures are retried from scratch up to
//! `max_page_retries` times with `retry_backoff` between attempts. Argument
//! and invariant errors fail the run immediately.

use super::args::{TaskDescriptor, UnmergeTask};
use super::runner::{BatchRunner, PageOutcome, PageReport, UnmergeSummary};
use super::task_store::{FileTaskStore, InMemoryTaskStore, TaskStore};
use crate::config::UnmergeConfig;
use crate::error::{Error, Result};
use crate::metrics::UnmergeMetrics;
use crate::types::RunId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lifecycle of a submitted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Waiting in the queue.
    Queued,
    /// Pages are being processed.
    Running,
    /// The source was exhausted.
    Completed(UnmergeSummary),
    /// The run was abandoned; its last pending task stays in the store.
    Failed(String),
}

impl RunStatus {
    /// Whether the run will make no further progress on its own.
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed(_) | RunStatus::Failed(_))
    }
}

/// Drives unmerge runs from a queue.
#[derive(Debug)]
pub struct UnmergeWorker {
    runner: BatchRunner,
    store: Arc<dyn TaskStore>,
    config: UnmergeConfig,
    queue_tx: mpsc::UnboundedSender<UnmergeTask>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<UnmergeTask>>>,
    queued: AtomicUsize,
    statuses: RwLock<HashMap<RunId, RunStatus>>,
}

/// Handle of a started worker loop.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the loop after the run in flight finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Unmerge worker loop panicked");
        }
    }
}

impl UnmergeWorker {
    /// Create a worker. The queue is not drained until [`start`](Self::start).
    pub fn new(
        runner: BatchRunner,
        store: Arc<dyn TaskStore>,
        config: UnmergeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            runner,
            store,
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            queued: AtomicUsize::new(0),
            statuses: RwLock::new(HashMap::new()),
        })
    }

    /// Create a worker whose task store follows `config.task_dir`: files
    /// under that directory, or memory when it is unset.
    pub async fn from_config(runner: BatchRunner, config: UnmergeConfig) -> Result<Self> {
        let store: Arc<dyn TaskStore> = match &config.task_dir {
            Some(dir) => Arc::new(FileTaskStore::new(dir).await?),
            None => Arc::new(InMemoryTaskStore::new()),
        };
        Self::new(runner, store, config)
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<UnmergeMetrics> {
        self.runner.metrics()
    }

    /// Current status of a run.
    pub fn status(&self, run_id: RunId) -> Option<RunStatus> {
        self.statuses.read().get(&run_id).cloned()
    }

    /// Task store backing this worker.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Runs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Drop the status of a finished run. Returns the dropped status, or
    /// `None` when the run is unknown or still in progress.
    pub fn forget(&self, run_id: RunId) -> Option<RunStatus> {
        let mut statuses = self.statuses.write();
        if !statuses.get(&run_id).is_some_and(RunStatus::is_finished) {
            return None;
        }
        statuses.remove(&run_id)
    }

    /// Persist `task` and queue it.
    ///
    /// Fails without persisting anything when the task is invalid or the
    /// queue already holds `queue_capacity` runs.
    pub async fn submit(&self, task: UnmergeTask) -> Result<RunId> {
        task.validate()?;
        if self.queued() >= self.config.queue_capacity {
            return Err(Error::Internal(format!(
                "unmerge queue full ({} runs waiting)",
                self.config.queue_capacity
            )));
        }

        let run_id = task.run_id();
        let header = task.header();
        tracing::info!(
            run_id = %run_id,
            project_id = header.project_id,
            source_group_id = header.source_group_id,
            replacement = header.replacement.kind(),
            "Unmerge submitted"
        );

        self.store.save(&task).await?;
        self.enqueue(task)?;
        Ok(run_id)
    }

    /// Parse a wire descriptor and submit it.
    pub async fn submit_descriptor(&self, descriptor: TaskDescriptor) -> Result<RunId> {
        let task = UnmergeTask::parse_with_batch_size(descriptor, self.config.default_batch_size)?;
        self.submit(task).await
    }

    /// Queue every task left pending by an earlier process. Returns how
    /// many runs were resumed.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.store.load_pending().await?;
        let count = pending.len();
        for task in pending {
            tracing::info!(
                run_id = %task.run_id(),
                phase = task.phase(),
                cursor = ?task.cursor(),
                "Resuming unmerge"
            );
            self.enqueue(task)?;
        }
        Ok(count)
    }

    fn enqueue(&self, task: UnmergeTask) -> Result<()> {
        let run_id = task.run_id();
        self.statuses.write().insert(run_id, RunStatus::Queued);
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.queue_tx.send(task).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.statuses
                .write()
                .insert(run_id, RunStatus::Failed("queue closed".to_string()));
            return Err(Error::Internal("unmerge queue closed".to_string()));
        }
        Ok(())
    }

    /// Spawn the loop that drains the queue.
    pub fn start(self: &Arc<Self>) -> Result<WorkerHandle> {
        let mut queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("unmerge worker already started".to_string()))?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let worker = Arc::clone(self);

        let join = tokio::spawn(async move {
            tracing::info!("Unmerge worker started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Unmerge worker shutting down");
                        break;
                    }
                    task = queue_rx.recv() => {
                        let Some(task) = task else { break };
                        worker.queued.fetch_sub(1, Ordering::AcqRel);
                        // Failures are recorded in the run status.
                        let _ = worker.run_to_completion(task).await;
                    }
                }
            }
        });

        Ok(WorkerHandle { shutdown_tx, join })
    }

    /// Run every remaining page of a run.
    pub async fn run_to_completion(&self, task: UnmergeTask) -> Result<UnmergeSummary> {
        let run_id = task.run_id();
        self.statuses.write().insert(run_id, RunStatus::Running);
        self.runner.metrics().record_run_started();

        match self.drive(task).await {
            Ok(summary) => {
                self.runner.metrics().record_run_completed();
                self.statuses
                    .write()
                    .insert(run_id, RunStatus::Completed(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Unmerge failed");
                self.runner.metrics().record_run_failed();
                self.statuses
                    .write()
                    .insert(run_id, RunStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(&self, mut task: UnmergeTask) -> Result<UnmergeSummary> {
        let mut page = 1u64;
        loop {
            let report = self.run_page_with_retry(&task, page).await?;
            match report.outcome {
                PageOutcome::Continue(next) => {
                    // Persist before dropping the current page.
                    self.store.save(&next).await?;
                    task = next;
                    page += 1;
                    tokio::task::yield_now().await;
                }
                PageOutcome::Complete(summary) => {
                    self.store.archive(&task).await?;
                    self.store.remove(task.run_id()).await?;
                    return Ok(summary);
                }
            }
        }
    }

    /// Run one page, retrying retryable failures.
    pub async fn run_page_with_retry(&self, task: &UnmergeTask, page: u64) -> Result<PageReport> {
        let attempts = self.config.max_page_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.runner.run_page(task).await {
                Ok(report) => return Ok(report),
                Err(e) => e,
            };
            self.runner.metrics().record_page_failure(&err);

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= attempts {
                return Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            self.runner.metrics().page_retries.inc();
            tracing::warn!(
                run_id = %task.run_id(),
                page,
                attempt,
                error = %err,
                "Page failed, retrying"
            );
            tokio::time::sleep(self.config.retry_backoff).await;
        }
    }
}

//! Configuration for the unmerge worker.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of events inspected per page.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Main configuration for the unmerge worker.
#[derive(Debug, Clone)]
pub struct UnmergeConfig {
    /// Page size used when a descriptor does not carry one.
    pub default_batch_size: usize,

    /// How many times a page is re-run after a retryable failure before
    /// the run is escalated as failed.
    pub max_page_retries: u32,

    /// Delay between attempts of the same page.
    pub retry_backoff: Duration,

    /// Runs allowed to wait in the queue before new submissions are
    /// refused. Resumed runs are not counted against it.
    pub queue_capacity: usize,

    /// Directory for durable task state. `None` keeps tasks in memory.
    pub task_dir: Option<PathBuf>,
}

impl Default for UnmergeConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
            max_page_retries: 3,
            retry_backoff: Duration::from_millis(50),
            queue_capacity: 64,
            task_dir: None,
        }
    }
}

impl UnmergeConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default page size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    /// Set the retry budget per page.
    pub fn with_max_page_retries(mut self, retries: u32) -> Self {
        self.max_page_retries = retries;
        self
    }

    /// Set the delay between page attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the task queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Persist tasks under `dir`.
    pub fn with_task_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_dir = Some(dir.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.default_batch_size == 0 {
            return Err(Error::Config("default_batch_size must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be > 0".to_string()));
        }
        Ok(())
    }
}

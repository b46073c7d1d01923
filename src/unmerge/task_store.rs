//! Durable storage for in-flight unmerge tasks.
//!
//! The worker saves every successor task before it acknowledges the page
//! that produced it. After a crash, [`TaskStore::load_pending`] returns the
//! page each unfinished run must execute next.
//!
//! # Storage Format
//!
//! ```text
//! tasks/
//!   ├── pending/
//!   │   ├── run_6f1c….bin     # next page of an unfinished run
//!   │   └── run_a83e….bin
//!   └── completed/
//!       └── run_0b9d….bin     # final page of a finished run
//! ```
//!
//! Files are `bincode` encoded and written atomically (temp file, fsync,
//! rename).

use super::args::UnmergeTask;
use crate::error::{Error, Result};
use crate::types::RunId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Storage for the next page of each unfinished run.
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    /// Save the task a run executes next, replacing any earlier one.
    async fn save(&self, task: &UnmergeTask) -> Result<()>;

    /// Load the pending task of a run.
    async fn load(&self, run_id: RunId) -> Result<Option<UnmergeTask>>;

    /// Load every pending task.
    async fn load_pending(&self) -> Result<Vec<UnmergeTask>>;

    /// Forget a run's pending task. Missing runs are ignored.
    async fn remove(&self, run_id: RunId) -> Result<()>;

    /// Keep the last task of a finished run.
    async fn archive(&self, task: &UnmergeTask) -> Result<()>;
}

// ============================================================================
// In-Memory Implementation (for testing)
// ============================================================================

/// In-memory task store.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    pending: RwLock<HashMap<RunId, UnmergeTask>>,
    archived: RwLock<Vec<UnmergeTask>>,
}

impl InMemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived tasks in archive order.
    pub fn archived(&self) -> Vec<UnmergeTask> {
        self.archived.read().clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &UnmergeTask) -> Result<()> {
        self.pending.write().insert(task.run_id(), task.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<UnmergeTask>> {
        Ok(self.pending.read().get(&run_id).cloned())
    }

    async fn load_pending(&self) -> Result<Vec<UnmergeTask>> {
        Ok(self.pending.read().values().cloned().collect())
    }

    async fn remove(&self, run_id: RunId) -> Result<()> {
        self.pending.write().remove(&run_id);
        Ok(())
    }

    async fn archive(&self, task: &UnmergeTask) -> Result<()> {
        self.archived.write().push(task.clone());
        Ok(())
    }
}

// ============================================================================
// File-Based Implementation
// ============================================================================

/// File-backed task store using async I/O.
#[derive(Debug)]
pub struct FileTaskStore {
    base_dir: PathBuf,
}

impl FileTaskStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        for dir in ["pending", "completed"] {
            fs::create_dir_all(base_dir.join(dir))
                .await
                .map_err(|e| Error::Internal(format!("Failed to create {dir} dir: {e}")))?;
        }

        Ok(Self { base_dir })
    }

    fn pending_path(&self, run_id: RunId) -> PathBuf {
        self.base_dir.join("pending").join(format!("run_{run_id}.bin"))
    }

    fn completed_path(&self, run_id: RunId) -> PathBuf {
        self.base_dir
            .join("completed")
            .join(format!("run_{run_id}.bin"))
    }

    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create temp file: {e}")))?;
        file.write_all(content)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write temp file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Internal(format!("Failed to sync temp file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to rename file: {e}")))?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = fs::File::open(path).await?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        Ok(content)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save(&self, task: &UnmergeTask) -> Result<()> {
        let content = bincode::serialize(task)?;
        self.atomic_write(&self.pending_path(task.run_id()), &content)
            .await?;

        tracing::debug!(
            run_id = %task.run_id(),
            phase = task.phase(),
            cursor = ?task.cursor(),
            "Saved pending task"
        );
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<UnmergeTask>> {
        match self.read_file(&self.pending_path(run_id)).await {
            Ok(content) => Ok(Some(bincode::deserialize(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Internal(format!("Failed to read task: {e}"))),
        }
    }

    async fn load_pending(&self) -> Result<Vec<UnmergeTask>> {
        let pending_dir = self.base_dir.join("pending");
        let mut tasks = Vec::new();

        let mut entries = fs::read_dir(&pending_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read pending dir: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read dir entry: {e}")))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "bin") {
                continue;
            }
            match self.read_file(&path).await {
                Ok(content) => match bincode::deserialize::<UnmergeTask>(&content) {
                    Ok(task) => tasks.push(task),
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "Failed to decode task file, skipping");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Failed to read task file, skipping");
                }
            }
        }

        tracing::info!(count = tasks.len(), "Loaded pending unmerge tasks from disk");
        Ok(tasks)
    }

    async fn remove(&self, run_id: RunId) -> Result<()> {
        match fs::remove_file(self.pending_path(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(format!("Failed to remove task: {e}"))),
        }
    }

    async fn archive(&self, task: &UnmergeTask) -> Result<()> {
        let content = bincode::serialize(task)?;
        self.atomic_write(&self.completed_path(task.run_id()), &content)
            .await?;
        tracing::debug!(run_id = %task.run_id(), "Archived task");
        Ok(())
    }
}

//! Core types shared by the unmerge engine and its collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Project identifier. All hash ownership is scoped by project.
pub type ProjectId = u64;

/// Group (issue) identifier.
pub type GroupId = u64;

/// User or system actor that requested the unmerge.
pub type ActorId = u64;

/// Fingerprint bucketing events for deduplication.
pub type ContentHash = String;

/// Key under which moved events are collected; one destination group
/// exists per key.
pub type DestinationKey = String;

/// Identity of one unmerge run across all of its pages.
pub type RunId = Uuid;

/// Destination key used by flat unmerges, which always produce exactly
/// one new group.
pub const DEFAULT_UNMERGE_KEY: &str = "default";

/// An event as seen by the unmerge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier, unique within the project.
    pub event_id: String,
    /// Owning project.
    pub project_id: ProjectId,
    /// Group the event currently belongs to.
    pub group_id: GroupId,
    /// Primary content hash.
    pub primary_hash: ContentHash,
    /// Coarse-to-fine hash sequence. Empty for events grouped without
    /// hierarchical hashing.
    pub hierarchical_hashes: Vec<ContentHash>,
    /// Event timestamp (unix millis).
    pub timestamp_ms: u64,
}

impl Event {
    /// Create an event without hierarchical hashes.
    pub fn new(
        event_id: impl Into<String>,
        project_id: ProjectId,
        group_id: GroupId,
        primary_hash: impl Into<ContentHash>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            project_id,
            group_id,
            primary_hash: primary_hash.into(),
            hierarchical_hashes: Vec::new(),
            timestamp_ms: 0,
        }
    }

    /// Attach a hierarchical hash sequence.
    pub fn with_hierarchical_hashes<I, S>(mut self, hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ContentHash>,
    {
        self.hierarchical_hashes = hashes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the event timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Hierarchical hash at `level`, if the sequence is that deep.
    pub fn hierarchical_hash(&self, level: usize) -> Option<&ContentHash> {
        self.hierarchical_hashes.get(level)
    }
}

/// Lock state of a hash lock table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashState {
    /// Normal ownership.
    Unlocked,
    /// Reserved by a running flat unmerge.
    LockedForMigration,
    /// Already subdivided by a hierarchical split.
    Split,
}

impl fmt::Display for HashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashState::Unlocked => write!(f, "unlocked"),
            HashState::LockedForMigration => write!(f, "locked_for_migration"),
            HashState::Split => write!(f, "split"),
        }
    }
}

/// One row of the hash lock table: `(project, hash) -> group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashLockEntry {
    /// Owning project.
    pub project_id: ProjectId,
    /// The hash.
    pub hash: ContentHash,
    /// Group that owns the hash.
    pub group_id: GroupId,
    /// Lock state.
    pub state: HashState,
}

impl HashLockEntry {
    /// Create an unlocked entry.
    pub fn new(project_id: ProjectId, hash: impl Into<ContentHash>, group_id: GroupId) -> Self {
        Self {
            project_id,
            hash: hash.into(),
            group_id,
            state: HashState::Unlocked,
        }
    }

    /// Set the lock state.
    pub fn with_state(mut self, state: HashState) -> Self {
        self.state = state;
        self
    }
}

/// Opaque pagination token handed out by an event source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a source-specific token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current time as unix millis.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

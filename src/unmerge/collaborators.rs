//! Interfaces of the external systems an unmerge run talks to.
//!
//! The batch runner never owns data itself. It reads events from an
//! [`EventSource`], flips hash ownership in a [`HashLockStore`], brackets
//! the analytics-side move with a [`StreamSnapshot`], and leaves an audit
//! trail in an [`ActivityLog`]. Destination groups come from a
//! [`GroupStore`].
//!
//! Every mutating call must be safe to repeat: pages are retried from
//! scratch after any failure.

use crate::error::Result;
use crate::types::{
    ActorId, ContentHash, Cursor, DestinationKey, Event, GroupId, HashState, ProjectId, RunId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One page of events returned by an [`EventSource`].
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    /// Events in insertion order.
    pub events: Vec<Event>,
    /// Token for the next page; `None` once the group is exhausted.
    pub next_cursor: Option<Cursor>,
}

impl EventPage {
    /// Whether the source reported no events past this page.
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Ordered, paginated reads of a group's events.
#[async_trait]
pub trait EventSource: Send + Sync + std::fmt::Debug {
    /// Fetch up to `limit` events of `group_id` strictly after `cursor`.
    ///
    /// Ordering must be stable across calls so that consecutive pages
    /// neither repeat nor skip events.
    async fn fetch_page(
        &self,
        project_id: ProjectId,
        group_id: GroupId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<EventPage>;
}

/// The authoritative `(project, hash) -> group` table.
#[async_trait]
pub trait HashLockStore: Send + Sync + std::fmt::Debug {
    /// Mark the given hashes owned by `owner` as locked for migration and
    /// return the set actually locked.
    ///
    /// Hashes already locked for migration are returned again, so a
    /// retried first page resolves the same set.
    async fn lock_hashes(
        &self,
        project_id: ProjectId,
        owner: GroupId,
        hashes: &[ContentHash],
    ) -> Result<BTreeSet<ContentHash>>;

    /// Upsert ownership. Lock state of existing rows is preserved; new
    /// rows start unlocked.
    async fn reassign(
        &self,
        project_id: ProjectId,
        assignments: &BTreeMap<ContentHash, GroupId>,
    ) -> Result<()>;

    /// Move rows in `expected` state back to `Unlocked`. Rows in any other
    /// state are left alone. Returns how many rows changed.
    async fn unlock(
        &self,
        project_id: ProjectId,
        hashes: &[ContentHash],
        expected: HashState,
    ) -> Result<usize>;
}

/// Which rows of the analytics store a stream snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamCriteria {
    /// All events whose primary hash is one of `hashes`.
    PrimaryHashes { hashes: Vec<ContentHash> },
    /// Events of `primary_hash` whose hierarchical sequence contains
    /// `hierarchical_hash`.
    Hierarchical {
        primary_hash: ContentHash,
        hierarchical_hash: ContentHash,
        skip_needs_final: bool,
    },
}

/// Handle of an open stream snapshot, carried across pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// Backend-assigned token.
    pub token: String,
    /// Project the snapshot is scoped to.
    pub project_id: ProjectId,
    /// Group events move out of.
    pub source_group_id: GroupId,
    /// Group events move into.
    pub destination_group_id: GroupId,
    /// Rows covered.
    pub criteria: StreamCriteria,
}

/// Consistency window on the analytics store.
#[async_trait]
pub trait StreamSnapshot: Send + Sync + std::fmt::Debug {
    /// Open a snapshot moving rows matching `criteria` from `source` to
    /// `destination`.
    async fn begin(
        &self,
        project_id: ProjectId,
        criteria: StreamCriteria,
        source_group_id: GroupId,
        destination_group_id: GroupId,
    ) -> Result<StreamState>;

    /// Close a snapshot. Closing an already-closed snapshot is a no-op.
    async fn end(&self, state: &StreamState) -> Result<()>;

    /// Hide a group from the analytics store entirely.
    async fn exclude_group(&self, project_id: ProjectId, group_id: GroupId) -> Result<()>;
}

/// What moved, attached to the audit record of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPayload {
    /// A flat unmerge moved these fingerprints.
    Fingerprints { fingerprints: Vec<ContentHash> },
    /// A hierarchical split produced a group for this hash.
    HierarchicalSplit { new_hierarchical_hash: ContentHash },
}

/// Audit record of one source/destination pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Project.
    pub project_id: ProjectId,
    /// Group events moved out of.
    pub source_group_id: GroupId,
    /// Group events moved into.
    pub destination_group_id: GroupId,
    /// Who requested the unmerge.
    pub actor_id: Option<ActorId>,
    /// What moved.
    pub payload: ActivityPayload,
    /// Creation time (unix millis).
    pub created_at_ms: u64,
}

impl ActivityRecord {
    /// Whether two records describe the same move, ignoring timestamps.
    pub fn same_move(&self, other: &ActivityRecord) -> bool {
        self.project_id == other.project_id
            && self.source_group_id == other.source_group_id
            && self.destination_group_id == other.destination_group_id
            && self.payload == other.payload
    }
}

/// Default number of records returned by [`ActivityLog::activities_for_group`].
pub const DEFAULT_ACTIVITY_LIMIT: usize = 100;

/// Audit trail of unmerges.
#[async_trait]
pub trait ActivityLog: Send + Sync + std::fmt::Debug {
    /// Record a move.
    async fn record(&self, record: ActivityRecord) -> Result<()>;

    /// Newest-first records where `group_id` is either side of a move.
    async fn activities_for_group(
        &self,
        group_id: GroupId,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>>;
}

/// Group lifecycle operations needed by an unmerge.
#[async_trait]
pub trait GroupStore: Send + Sync + std::fmt::Debug {
    /// Get or create the destination group for `(run_id, key)`.
    ///
    /// Repeated calls with the same run and key return the same group.
    async fn create_destination(
        &self,
        project_id: ProjectId,
        source_group_id: GroupId,
        run_id: RunId,
        key: &DestinationKey,
    ) -> Result<GroupId>;

    /// Reset denormalized source statistics (last seen, counts) so they
    /// can be rebuilt from the events that stay.
    ///
    /// Must be idempotent: a page that fails after the reset is re-run
    /// before the reset flag reaches the successor task, and resets again.
    async fn reset_source_fields(&self, project_id: ProjectId, group_id: GroupId) -> Result<()>;
}

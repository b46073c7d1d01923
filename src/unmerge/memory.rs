//! In-memory implementations of every collaborator.
//!
//! Used by tests and the demo. Each store routes its calls through a
//! shared [`FaultInjector`] so failures can be injected per call site:
//!
//! | fault point               | store               |
//! |---------------------------|---------------------|
//! | `events.fetch_page`       | event source        |
//! | `hash_locks.lock`         | hash lock table     |
//! | `hash_locks.reassign`     | hash lock table     |
//! | `hash_locks.unlock`       | hash lock table     |
//! | `stream.begin`            | stream snapshots    |
//! | `stream.end`              | stream snapshots    |
//! | `stream.exclude`          | stream snapshots    |
//! | `activity.record`         | activity log        |
//! | `groups.create`           | group store         |
//! | `groups.reset`            | group store         |

use super::collaborators::{
    ActivityLog, ActivityRecord, EventPage, EventSource, GroupStore, HashLockStore,
    StreamCriteria, StreamSnapshot, StreamState,
};
use crate::error::{Error, Result};
use crate::testing::FaultInjector;
use crate::types::{
    ContentHash, Cursor, DestinationKey, Event, GroupId, HashLockEntry, HashState, ProjectId,
    RunId,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Event Source
// ============================================================================

/// Events per `(project, group)` in insertion order. The cursor is the
/// offset of the next undelivered event.
#[derive(Debug, Default)]
pub struct InMemoryEventSource {
    groups: RwLock<HashMap<(ProjectId, GroupId), Vec<Event>>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryEventSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault injector.
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Append an event to its group.
    pub fn insert(&self, event: Event) {
        self.groups
            .write()
            .entry((event.project_id, event.group_id))
            .or_default()
            .push(event);
    }

    /// Append many events.
    pub fn extend(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.insert(event);
        }
    }

    /// Number of events stored for a group.
    pub fn len(&self, project_id: ProjectId, group_id: GroupId) -> usize {
        self.groups
            .read()
            .get(&(project_id, group_id))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn fetch_page(
        &self,
        project_id: ProjectId,
        group_id: GroupId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<EventPage> {
        self.faults.check("events.fetch_page", "events")?;

        let offset = match cursor {
            Some(cursor) => cursor.as_str().parse::<usize>().map_err(|_| {
                Error::Argument(format!("cursor {cursor:?} is not an event offset"))
            })?,
            None => 0,
        };

        let groups = self.groups.read();
        let events = groups
            .get(&(project_id, group_id))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let start = offset.min(events.len());
        let end = start.saturating_add(limit).min(events.len());

        Ok(EventPage {
            events: events[start..end].to_vec(),
            next_cursor: (end < events.len()).then(|| Cursor::new(end.to_string())),
        })
    }
}

// ============================================================================
// Hash Lock Table
// ============================================================================

/// Hash lock table keyed by `(project, hash)`.
#[derive(Debug, Default)]
pub struct InMemoryHashLockTable {
    entries: RwLock<HashMap<(ProjectId, ContentHash), HashLockEntry>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryHashLockTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault injector.
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Insert or replace a row.
    pub fn insert(&self, entry: HashLockEntry) {
        self.entries
            .write()
            .insert((entry.project_id, entry.hash.clone()), entry);
    }

    /// Look up a row.
    pub fn entry(&self, project_id: ProjectId, hash: &str) -> Option<HashLockEntry> {
        self.entries
            .read()
            .get(&(project_id, hash.to_string()))
            .cloned()
    }

    /// Hashes currently owned by a group, sorted.
    pub fn owned_by(&self, project_id: ProjectId, group_id: GroupId) -> Vec<ContentHash> {
        let mut hashes: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|e| e.project_id == project_id && e.group_id == group_id)
            .map(|e| e.hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    /// All rows, sorted by project and hash.
    pub fn snapshot(&self) -> Vec<HashLockEntry> {
        let mut rows: Vec<_> = self.entries.read().values().cloned().collect();
        rows.sort_by(|a, b| (a.project_id, &a.hash).cmp(&(b.project_id, &b.hash)));
        rows
    }
}

#[async_trait]
impl HashLockStore for InMemoryHashLockTable {
    async fn lock_hashes(
        &self,
        project_id: ProjectId,
        owner: GroupId,
        hashes: &[ContentHash],
    ) -> Result<BTreeSet<ContentHash>> {
        self.faults.check("hash_locks.lock", "hash_locks")?;

        let mut entries = self.entries.write();
        let mut locked = BTreeSet::new();
        for hash in hashes {
            let Some(entry) = entries.get_mut(&(project_id, hash.clone())) else {
                continue;
            };
            match entry.state {
                HashState::Unlocked if entry.group_id == owner => {
                    entry.state = HashState::LockedForMigration;
                    locked.insert(hash.clone());
                }
                HashState::LockedForMigration => {
                    locked.insert(hash.clone());
                }
                _ => {}
            }
        }
        Ok(locked)
    }

    async fn reassign(
        &self,
        project_id: ProjectId,
        assignments: &BTreeMap<ContentHash, GroupId>,
    ) -> Result<()> {
        self.faults.check("hash_locks.reassign", "hash_locks")?;

        let mut entries = self.entries.write();
        for (hash, group_id) in assignments {
            entries
                .entry((project_id, hash.clone()))
                .and_modify(|e| e.group_id = *group_id)
                .or_insert_with(|| HashLockEntry::new(project_id, hash.clone(), *group_id));
        }
        Ok(())
    }

    async fn unlock(
        &self,
        project_id: ProjectId,
        hashes: &[ContentHash],
        expected: HashState,
    ) -> Result<usize> {
        self.faults.check("hash_locks.unlock", "hash_locks")?;

        let mut entries = self.entries.write();
        let mut changed = 0;
        for hash in hashes {
            if let Some(entry) = entries.get_mut(&(project_id, hash.clone())) {
                if entry.state == expected && expected != HashState::Unlocked {
                    entry.state = HashState::Unlocked;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

// ============================================================================
// Stream Snapshots
// ============================================================================

#[derive(Debug, Default)]
struct SnapshotBook {
    open: HashMap<String, StreamState>,
    closed: HashSet<String>,
    excluded: HashSet<(ProjectId, GroupId)>,
    begun: u64,
}

/// Stream snapshots with deterministic tokens, so re-opening the same
/// window after a retry yields the same handle.
#[derive(Debug, Default)]
pub struct InMemoryStreamSnapshots {
    book: Mutex<SnapshotBook>,
    faults: Arc<FaultInjector>,
}

impl InMemoryStreamSnapshots {
    /// Create an empty snapshot registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault injector.
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Snapshots currently open.
    pub fn open_count(&self) -> usize {
        self.book.lock().open.len()
    }

    /// Snapshots closed so far.
    pub fn closed_count(&self) -> usize {
        self.book.lock().closed.len()
    }

    /// Distinct snapshots ever opened.
    pub fn begun_count(&self) -> u64 {
        self.book.lock().begun
    }

    /// Whether a group was excluded from the stream.
    pub fn is_excluded(&self, project_id: ProjectId, group_id: GroupId) -> bool {
        self.book.lock().excluded.contains(&(project_id, group_id))
    }

    fn token(
        project_id: ProjectId,
        criteria: &StreamCriteria,
        source_group_id: GroupId,
        destination_group_id: GroupId,
    ) -> String {
        let scope = match criteria {
            StreamCriteria::PrimaryHashes { hashes } => format!("primary:{}", hashes.join(",")),
            StreamCriteria::Hierarchical {
                primary_hash,
                hierarchical_hash,
                ..
            } => format!("hierarchical:{primary_hash}/{hierarchical_hash}"),
        };
        format!("{project_id}:{source_group_id}->{destination_group_id}:{scope}")
    }
}

#[async_trait]
impl StreamSnapshot for InMemoryStreamSnapshots {
    async fn begin(
        &self,
        project_id: ProjectId,
        criteria: StreamCriteria,
        source_group_id: GroupId,
        destination_group_id: GroupId,
    ) -> Result<StreamState> {
        self.faults.check("stream.begin", "stream")?;

        let token = Self::token(project_id, &criteria, source_group_id, destination_group_id);
        let mut book = self.book.lock();
        if let Some(state) = book.open.get(&token) {
            return Ok(state.clone());
        }
        let state = StreamState {
            token: token.clone(),
            project_id,
            source_group_id,
            destination_group_id,
            criteria,
        };
        book.closed.remove(&token);
        book.open.insert(token, state.clone());
        book.begun += 1;
        Ok(state)
    }

    async fn end(&self, state: &StreamState) -> Result<()> {
        self.faults.check("stream.end", "stream")?;

        let mut book = self.book.lock();
        book.open.remove(&state.token);
        book.closed.insert(state.token.clone());
        Ok(())
    }

    async fn exclude_group(&self, project_id: ProjectId, group_id: GroupId) -> Result<()> {
        self.faults.check("stream.exclude", "stream")?;
        self.book.lock().excluded.insert((project_id, group_id));
        Ok(())
    }
}

// ============================================================================
// Activity Log
// ============================================================================

/// Append-only activity log that ignores exact repeats of a move.
#[derive(Debug, Default)]
pub struct InMemoryActivityLog {
    records: RwLock<Vec<ActivityRecord>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryActivityLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault injector.
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl ActivityLog for InMemoryActivityLog {
    async fn record(&self, record: ActivityRecord) -> Result<()> {
        self.faults.check("activity.record", "activity")?;

        let mut records = self.records.write();
        if !records.iter().any(|r| r.same_move(&record)) {
            records.push(record);
        }
        Ok(())
    }

    async fn activities_for_group(
        &self,
        group_id: GroupId,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .rev()
            .filter(|r| r.source_group_id == group_id || r.destination_group_id == group_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Group Store
// ============================================================================

/// Group store handing out sequential ids.
#[derive(Debug)]
pub struct InMemoryGroupStore {
    next_id: AtomicU64,
    destinations: Mutex<HashMap<(RunId, DestinationKey), GroupId>>,
    resets: Mutex<HashMap<(ProjectId, GroupId), u32>>,
    faults: Arc<FaultInjector>,
}

impl Default for InMemoryGroupStore {
    fn default() -> Self {
        Self::starting_at(1_000)
    }
}

impl InMemoryGroupStore {
    /// Create a store whose first new group id is 1000.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose first new group id is `first_id`.
    pub fn starting_at(first_id: GroupId) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            destinations: Mutex::new(HashMap::new()),
            resets: Mutex::new(HashMap::new()),
            faults: Arc::new(FaultInjector::new()),
        }
    }

    /// Share a fault injector.
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Number of destination groups created.
    pub fn created_count(&self) -> usize {
        self.destinations.lock().len()
    }

    /// How many times a group's fields were reset.
    pub fn reset_count(&self, project_id: ProjectId, group_id: GroupId) -> u32 {
        self.resets
            .lock()
            .get(&(project_id, group_id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl GroupStore for InMemoryGroupStore {
    async fn create_destination(
        &self,
        _project_id: ProjectId,
        _source_group_id: GroupId,
        run_id: RunId,
        key: &DestinationKey,
    ) -> Result<GroupId> {
        self.faults.check("groups.create", "groups")?;

        let mut destinations = self.destinations.lock();
        let id = *destinations
            .entry((run_id, key.clone()))
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(id)
    }

    async fn reset_source_fields(&self, project_id: ProjectId, group_id: GroupId) -> Result<()> {
        self.faults.check("groups.reset", "groups")?;
        *self.resets.lock().entry((project_id, group_id)).or_insert(0) += 1;
        Ok(())
    }
}

//! Unmerge task arguments: the explicit state of the page state machine.
//!
//! Events of the source group are processed in pages, and each page is one
//! state of a two-state machine:
//!
//! ```text
//!            first migrating event found
//!   Initial ─────────────────────────────▶ Successive(1) ─▶ Successive(2) ─▶ … ─▶ Terminal
//!      │                                                                          ▲
//!      └──────────────── source exhausted, nothing migrated ─────────────────────┘
//! ```
//!
//! An [`InitialPage`] has not migrated anything yet. While it keeps
//! scanning without a match it carries its own [`PageProgress`] so the scan
//! stays resumable. Once a page opens a destination, every following page
//! is a [`SuccessivePage`] carrying the cursor, the locked hash set and the
//! destination map.
//!
//! Tasks are immutable values. A page consumes one task and produces at
//! most one successor; nothing else is shared between pages.
//!
//! [`TaskDescriptor`] is the wire form crossing the queue boundary. It
//! still accepts the legacy `fingerprints` / `destination_id` /
//! `eventstream_state` fields on input but never emits them.

use super::collaborators::StreamState;
use super::replacement::{FlatReplacement, ReplacementSpec};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{Error, Result};
use crate::types::{
    ActorId, ContentHash, Cursor, DestinationKey, GroupId, ProjectId, RunId, DEFAULT_UNMERGE_KEY,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// A destination group and its stream snapshot, if one was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination group.
    pub group_id: GroupId,
    /// Open stream snapshot. `None` for caller-supplied destinations that
    /// have not received events yet.
    pub stream: Option<StreamState>,
}

impl Destination {
    /// A destination without an open stream.
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            stream: None,
        }
    }

    /// Whether events have started moving into this destination.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Destination key to destination group.
pub type DestinationMap = BTreeMap<DestinationKey, Destination>;

/// Fields shared by both phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHeader {
    /// Identity of the run across pages.
    pub run_id: RunId,
    /// Project.
    pub project_id: ProjectId,
    /// Group being split.
    pub source_group_id: GroupId,
    /// Which events move and how they are keyed.
    pub replacement: ReplacementSpec,
    /// Who requested the unmerge.
    pub actor_id: Option<ActorId>,
    /// Events per page.
    pub batch_size: usize,
}

/// Pagination state carried between pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageProgress {
    /// Resume position in the source group.
    pub cursor: Cursor,
    /// Hashes locked by the first page.
    pub locked_hashes: BTreeSet<ContentHash>,
    /// Whether the one-time source field reset already happened.
    pub source_fields_reset: bool,
}

/// A page before any event has migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPage {
    /// Shared fields.
    pub header: TaskHeader,
    /// Caller-supplied destinations. Empty in production.
    pub destinations: DestinationMap,
    /// Scan position once earlier pages came up empty.
    pub progress: Option<PageProgress>,
}

/// A page after at least one destination was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessivePage {
    /// Shared fields.
    pub header: TaskHeader,
    /// Destinations opened so far.
    pub destinations: DestinationMap,
    /// Pagination state.
    pub progress: PageProgress,
}

/// One page of unmerge work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmergeTask {
    /// Nothing migrated yet.
    Initial(InitialPage),
    /// Migration in progress.
    Successive(SuccessivePage),
}

impl UnmergeTask {
    /// Start a new run.
    pub fn initial(
        project_id: ProjectId,
        source_group_id: GroupId,
        replacement: impl Into<ReplacementSpec>,
        actor_id: Option<ActorId>,
        batch_size: usize,
    ) -> Self {
        UnmergeTask::Initial(InitialPage {
            header: TaskHeader {
                run_id: Uuid::new_v4(),
                project_id,
                source_group_id,
                replacement: replacement.into(),
                actor_id,
                batch_size,
            },
            destinations: DestinationMap::new(),
            progress: None,
        })
    }

    /// Unmerge into an existing group instead of creating one.
    pub fn with_destination(mut self, key: impl Into<DestinationKey>, group_id: GroupId) -> Self {
        match &mut self {
            UnmergeTask::Initial(page) => {
                page.destinations.insert(key.into(), Destination::new(group_id));
            }
            UnmergeTask::Successive(page) => {
                page.destinations.insert(key.into(), Destination::new(group_id));
            }
        }
        self
    }

    /// Shared fields.
    pub fn header(&self) -> &TaskHeader {
        match self {
            UnmergeTask::Initial(page) => &page.header,
            UnmergeTask::Successive(page) => &page.header,
        }
    }

    /// Run identity.
    pub fn run_id(&self) -> RunId {
        self.header().run_id
    }

    /// Destination map.
    pub fn destinations(&self) -> &DestinationMap {
        match self {
            UnmergeTask::Initial(page) => &page.destinations,
            UnmergeTask::Successive(page) => &page.destinations,
        }
    }

    /// Pagination state, if any page has run.
    pub fn progress(&self) -> Option<&PageProgress> {
        match self {
            UnmergeTask::Initial(page) => page.progress.as_ref(),
            UnmergeTask::Successive(page) => Some(&page.progress),
        }
    }

    /// Resume position.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.progress().map(|p| &p.cursor)
    }

    /// Whether the one-time source reset already happened.
    pub fn source_fields_reset(&self) -> bool {
        self.progress().is_some_and(|p| p.source_fields_reset)
    }

    /// Whether nothing has migrated yet.
    pub fn is_initial(&self) -> bool {
        matches!(self, UnmergeTask::Initial(_))
    }

    /// Reject tasks that could never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.header().batch_size == 0 {
            return Err(Error::Argument(format!(
                "run {}: batch_size must be > 0",
                self.run_id()
            )));
        }
        Ok(())
    }

    /// Short phase name for logs.
    pub fn phase(&self) -> &'static str {
        match self {
            UnmergeTask::Initial(_) => "initial",
            UnmergeTask::Successive(_) => "successive",
        }
    }

    /// Build the task for the next page.
    ///
    /// The successor is `Successive` as soon as any destination has an
    /// open stream, and stays `Initial` otherwise.
    pub fn successor(
        header: TaskHeader,
        destinations: DestinationMap,
        progress: PageProgress,
    ) -> Self {
        if destinations.values().any(Destination::is_open) {
            UnmergeTask::Successive(SuccessivePage {
                header,
                destinations,
                progress,
            })
        } else {
            UnmergeTask::Initial(InitialPage {
                header,
                destinations,
                progress: Some(progress),
            })
        }
    }

    /// Parse a wire descriptor, applying legacy defaults.
    pub fn parse(descriptor: TaskDescriptor) -> Result<Self> {
        Self::parse_with_batch_size(descriptor, DEFAULT_BATCH_SIZE)
    }

    /// Parse a wire descriptor, using `default_batch_size` when the
    /// descriptor does not carry one.
    pub fn parse_with_batch_size(
        descriptor: TaskDescriptor,
        default_batch_size: usize,
    ) -> Result<Self> {
        let TaskDescriptor {
            run_id,
            project_id,
            source_id,
            destination_id,
            fingerprints,
            actor_id,
            cursor,
            batch_size,
            source_fields_reset,
            eventstream_state,
            replacement,
            locked_hashes,
            destinations,
        } = descriptor;

        let replacement = match (replacement, &fingerprints) {
            (Some(replacement), _) => replacement,
            (None, Some(fingerprints)) => {
                ReplacementSpec::Flat(FlatReplacement::new(fingerprints.iter().cloned()))
            }
            (None, None) => {
                return Err(Error::Argument(
                    "either fingerprints or replacement is required".to_string(),
                ))
            }
        };

        let batch_size = batch_size.unwrap_or(default_batch_size);
        if batch_size == 0 {
            return Err(Error::Argument("batch_size must be > 0".to_string()));
        }

        let destinations = match destinations {
            Some(destinations) => destinations,
            None => match destination_id {
                Some(group_id) => BTreeMap::from([(
                    DEFAULT_UNMERGE_KEY.to_string(),
                    Destination {
                        group_id,
                        stream: eventstream_state.clone(),
                    },
                )]),
                None => DestinationMap::new(),
            },
        };
        validate_destinations(source_id, &destinations)?;

        let header = TaskHeader {
            run_id: run_id.unwrap_or_else(Uuid::new_v4),
            project_id,
            source_group_id: source_id,
            replacement,
            actor_id,
            batch_size,
        };

        match cursor {
            None => {
                if eventstream_state.is_some() {
                    return Err(Error::Argument(
                        "initial page cannot carry stream state".to_string(),
                    ));
                }
                if source_fields_reset {
                    return Err(Error::Argument(
                        "initial page cannot have source fields reset".to_string(),
                    ));
                }
                if destinations.values().any(Destination::is_open) {
                    return Err(Error::Argument(
                        "initial page cannot carry open destinations".to_string(),
                    ));
                }
                Ok(UnmergeTask::Initial(InitialPage {
                    header,
                    destinations,
                    progress: None,
                }))
            }
            Some(cursor) => {
                let locked_hashes = locked_hashes.or(fingerprints).ok_or_else(|| {
                    Error::Argument(
                        "resumed page requires locked_hashes or fingerprints".to_string(),
                    )
                })?;
                let progress = PageProgress {
                    cursor,
                    locked_hashes: locked_hashes.into_iter().collect(),
                    source_fields_reset,
                };
                Ok(UnmergeTask::successor(header, destinations, progress))
            }
        }
    }

    /// Wire form of this task. Legacy shadow fields are always cleared.
    pub fn dump(&self) -> TaskDescriptor {
        let header = self.header();
        let progress = self.progress();
        TaskDescriptor {
            run_id: Some(header.run_id),
            project_id: header.project_id,
            source_id: header.source_group_id,
            destination_id: None,
            fingerprints: None,
            actor_id: header.actor_id,
            cursor: progress.map(|p| p.cursor.clone()),
            batch_size: Some(header.batch_size),
            source_fields_reset: progress.is_some_and(|p| p.source_fields_reset),
            eventstream_state: None,
            replacement: Some(header.replacement.clone()),
            locked_hashes: progress.map(|p| p.locked_hashes.iter().cloned().collect()),
            destinations: Some(self.destinations().clone()),
        }
    }

    /// Encode for the queue.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.dump())?)
    }

    /// Decode from the queue.
    pub fn from_json(data: &str) -> Result<Self> {
        let descriptor: TaskDescriptor = serde_json::from_str(data)?;
        Self::parse(descriptor)
    }
}

/// Destination groups must be distinct from each other and from the source.
fn validate_destinations(source_id: GroupId, destinations: &DestinationMap) -> Result<()> {
    let mut seen = HashSet::new();
    for (key, destination) in destinations {
        if destination.group_id == source_id {
            return Err(Error::Invariant(format!(
                "destination {key:?} points at the source group {source_id}"
            )));
        }
        if !seen.insert(destination.group_id) {
            return Err(Error::Invariant(format!(
                "group {} is the destination of more than one key",
                destination.group_id
            )));
        }
    }
    Ok(())
}

/// Wire form of an unmerge task.
///
/// Every field except the project and source may be absent so that
/// descriptors written by older producers still parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Run identity; generated when absent.
    #[serde(default)]
    pub run_id: Option<RunId>,
    /// Project.
    pub project_id: ProjectId,
    /// Group being split.
    pub source_id: GroupId,
    /// Legacy single destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<GroupId>,
    /// Legacy flat fingerprint list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprints: Option<Vec<ContentHash>>,
    /// Requesting actor.
    #[serde(default)]
    pub actor_id: Option<ActorId>,
    /// Resume position.
    #[serde(default, alias = "last_event")]
    pub cursor: Option<Cursor>,
    /// Events per page.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Whether the one-time source reset already happened.
    #[serde(default)]
    pub source_fields_reset: bool,
    /// Legacy stream state of the single destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventstream_state: Option<StreamState>,
    /// Replacement policy.
    #[serde(default)]
    pub replacement: Option<ReplacementSpec>,
    /// Hashes locked by the first page.
    #[serde(default, alias = "locked_primary_hashes")]
    pub locked_hashes: Option<Vec<ContentHash>>,
    /// Destination map.
    #[serde(default)]
    pub destinations: Option<DestinationMap>,
}

impl TaskDescriptor {
    /// Minimal descriptor for a new run.
    pub fn new(project_id: ProjectId, source_id: GroupId) -> Self {
        Self {
            project_id,
            source_id,
            ..Default::default()
        }
    }
}

//! Replacement policies: which events leave the source group and where
//! they land.
//!
//! A [`ReplacementSpec`] is fixed when the unmerge is requested and then
//! travels verbatim with every page. Its [`decide`](ReplacementSpec::decide)
//! function is pure, so re-running a page after a crash routes every event
//! exactly as the first attempt did.
//!
//! # Variants
//!
//! - [`FlatReplacement`]: events whose primary hash is one of a fixed
//!   fingerprint set move into a single new group.
//! - [`HierarchicalReplacement`]: events of one primary hash are split by
//!   a deeper level of their hierarchical hash sequence, producing one new
//!   group per distinct hash at that level.

use super::collaborators::{
    ActivityPayload, HashLockStore, StreamCriteria, StreamSnapshot, StreamState,
};
use crate::error::Result;
use crate::types::{
    ContentHash, DestinationKey, Event, GroupId, HashState, ProjectId, DEFAULT_UNMERGE_KEY,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Classic unmerge by primary hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatReplacement {
    /// Primary hashes to move.
    pub fingerprints: BTreeSet<ContentHash>,
}

impl FlatReplacement {
    /// Create a flat replacement for `fingerprints`.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ContentHash>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

/// Split of one primary hash along its hierarchical hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchicalReplacement {
    /// Only events with this primary hash are candidates.
    pub primary_hash: ContentHash,
    /// Hash that must appear at `filter_level`.
    pub filter_hash: ContentHash,
    /// Level checked against `filter_hash`.
    pub filter_level: usize,
    /// Level whose hash becomes the destination key.
    pub new_level: usize,
    /// Every candidate event is expected to move, so the source group can
    /// be excluded from the stream once the run completes.
    pub assume_source_emptied: bool,
    /// Hashes in `Split` state to unlock when rows are reassigned.
    pub reset_hashes: Vec<ContentHash>,
}

/// Polymorphic replacement descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementSpec {
    /// Move a fixed fingerprint set into one group.
    Flat(FlatReplacement),
    /// Split one primary hash into many groups.
    Hierarchical(HierarchicalReplacement),
}

impl From<FlatReplacement> for ReplacementSpec {
    fn from(flat: FlatReplacement) -> Self {
        ReplacementSpec::Flat(flat)
    }
}

impl From<HierarchicalReplacement> for ReplacementSpec {
    fn from(hierarchical: HierarchicalReplacement) -> Self {
        ReplacementSpec::Hierarchical(hierarchical)
    }
}

impl ReplacementSpec {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplacementSpec::Flat(_) => "flat",
            ReplacementSpec::Hierarchical(_) => "hierarchical",
        }
    }

    /// Destination key for `event`, or `None` if it stays in the source.
    ///
    /// Never fails: events with missing or short hash sequences simply
    /// stay.
    pub fn decide(
        &self,
        event: &Event,
        locked_hashes: &BTreeSet<ContentHash>,
    ) -> Option<DestinationKey> {
        match self {
            ReplacementSpec::Flat(flat) => {
                let hash = &event.primary_hash;
                if flat.fingerprints.contains(hash) && locked_hashes.contains(hash) {
                    Some(DEFAULT_UNMERGE_KEY.to_string())
                } else {
                    None
                }
            }
            ReplacementSpec::Hierarchical(h) => {
                if event.primary_hash != h.primary_hash {
                    return None;
                }
                let hashes = &event.hierarchical_hashes;
                if hashes.get(h.filter_level)? != &h.filter_hash {
                    return None;
                }
                // Out-of-range levels fall back to the finest hash available.
                hashes.get(h.new_level).or_else(|| hashes.last()).cloned()
            }
        }
    }

    /// Hashes to lock before the first page is inspected.
    pub fn hashes_to_lock(&self) -> Vec<ContentHash> {
        match self {
            ReplacementSpec::Flat(flat) => flat.fingerprints.iter().cloned().collect(),
            ReplacementSpec::Hierarchical(_) => Vec::new(),
        }
    }

    /// Analytics rows covered by the destination stream for `key`.
    pub fn stream_criteria(&self, key: &str) -> StreamCriteria {
        match self {
            ReplacementSpec::Flat(flat) => StreamCriteria::PrimaryHashes {
                hashes: flat.fingerprints.iter().cloned().collect(),
            },
            ReplacementSpec::Hierarchical(h) => StreamCriteria::Hierarchical {
                primary_hash: h.primary_hash.clone(),
                hierarchical_hash: key.to_string(),
                skip_needs_final: h.assume_source_emptied,
            },
        }
    }

    /// Open the stream snapshot for a destination.
    pub async fn begin_destination_stream(
        &self,
        snapshots: &dyn StreamSnapshot,
        project_id: ProjectId,
        key: &str,
        source_group_id: GroupId,
        destination_group_id: GroupId,
    ) -> Result<StreamState> {
        snapshots
            .begin(
                project_id,
                self.stream_criteria(key),
                source_group_id,
                destination_group_id,
            )
            .await
    }

    /// Close the stream snapshot of a destination.
    pub async fn end_destination_stream(
        &self,
        snapshots: &dyn StreamSnapshot,
        state: &StreamState,
    ) -> Result<()> {
        snapshots.end(state).await
    }

    /// Point the hash rows of `key` at `destination_group_id`.
    ///
    /// Both variants are upserts, so repeating them is harmless.
    pub async fn apply_row_reassignment(
        &self,
        store: &dyn HashLockStore,
        project_id: ProjectId,
        key: &str,
        destination_group_id: GroupId,
        locked_hashes: &BTreeSet<ContentHash>,
    ) -> Result<()> {
        let assignments: BTreeMap<ContentHash, GroupId> = match self {
            ReplacementSpec::Flat(_) => locked_hashes
                .iter()
                .map(|hash| (hash.clone(), destination_group_id))
                .collect(),
            ReplacementSpec::Hierarchical(h) => {
                if !h.reset_hashes.is_empty() {
                    store
                        .unlock(project_id, &h.reset_hashes, HashState::Split)
                        .await?;
                }
                BTreeMap::from([(key.to_string(), destination_group_id)])
            }
        };
        store.reassign(project_id, &assignments).await
    }

    /// Audit payload for the destination created under `key`.
    pub fn activity_payload(&self, key: &str) -> ActivityPayload {
        match self {
            ReplacementSpec::Flat(flat) => {
                debug_assert_eq!(key, DEFAULT_UNMERGE_KEY);
                ActivityPayload::Fingerprints {
                    fingerprints: flat.fingerprints.iter().cloned().collect(),
                }
            }
            ReplacementSpec::Hierarchical(_) => ActivityPayload::HierarchicalSplit {
                new_hierarchical_hash: key.to_string(),
            },
        }
    }

    /// Final step of a run. Excluding an already-excluded group is a no-op
    /// on the snapshot side.
    pub async fn on_complete(
        &self,
        snapshots: &dyn StreamSnapshot,
        project_id: ProjectId,
        source_group_id: GroupId,
    ) -> Result<()> {
        match self {
            ReplacementSpec::Flat(_) => Ok(()),
            ReplacementSpec::Hierarchical(h) => {
                if h.assume_source_emptied {
                    snapshots.exclude_group(project_id, source_group_id).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unmerge::memory::{InMemoryHashLockTable, InMemoryStreamSnapshots};
    use crate::types::HashLockEntry;
    use proptest::prelude::*;

    fn locked(hashes: &[&str]) -> BTreeSet<ContentHash> {
        hashes.iter().map(|h| h.to_string()).collect()
    }

    fn hierarchical(new_level: usize) -> ReplacementSpec {
        HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "a".to_string(),
            filter_level: 0,
            new_level,
            assume_source_emptied: false,
            reset_hashes: Vec::new(),
        }
        .into()
    }

    #[test]
    fn test_flat_requires_fingerprint_and_lock() {
        let spec: ReplacementSpec = FlatReplacement::new(["x", "y"]).into();
        let event = Event::new("e1", 1, 10, "x");

        assert_eq!(
            spec.decide(&event, &locked(&["x"])),
            Some(DEFAULT_UNMERGE_KEY.to_string())
        );
        // In the fingerprint set but lost the lock race.
        assert_eq!(spec.decide(&event, &locked(&["y"])), None);
        // Locked but not requested.
        let other = Event::new("e2", 1, 10, "z");
        assert_eq!(spec.decide(&other, &locked(&["z"])), None);
    }

    #[test]
    fn test_hierarchical_match_uses_new_level() {
        let spec = hierarchical(1);
        let event = Event::new("e1", 1, 10, "p").with_hierarchical_hashes(["a", "b", "c"]);
        assert_eq!(spec.decide(&event, &BTreeSet::new()), Some("b".to_string()));
    }

    #[test]
    fn test_hierarchical_falls_back_to_finest_level() {
        let spec = hierarchical(5);
        let event = Event::new("e1", 1, 10, "p").with_hierarchical_hashes(["a", "b", "c"]);
        assert_eq!(spec.decide(&event, &BTreeSet::new()), Some("c".to_string()));
    }

    #[test]
    fn test_hierarchical_non_matches_stay() {
        let spec: ReplacementSpec = HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "b".to_string(),
            filter_level: 1,
            new_level: 2,
            assume_source_emptied: false,
            reset_hashes: Vec::new(),
        }
        .into();
        let none = BTreeSet::new();

        // Wrong primary hash.
        let e = Event::new("e1", 1, 10, "q").with_hierarchical_hashes(["a", "b", "c"]);
        assert_eq!(spec.decide(&e, &none), None);
        // No hierarchical hashes at all.
        let e = Event::new("e2", 1, 10, "p");
        assert_eq!(spec.decide(&e, &none), None);
        // Sequence shorter than the filter level.
        let e = Event::new("e3", 1, 10, "p").with_hierarchical_hashes(["a"]);
        assert_eq!(spec.decide(&e, &none), None);
        // Different hash at the filter level.
        let e = Event::new("e4", 1, 10, "p").with_hierarchical_hashes(["a", "x", "c"]);
        assert_eq!(spec.decide(&e, &none), None);
    }

    #[test]
    fn test_hashes_to_lock() {
        let flat: ReplacementSpec = FlatReplacement::new(["b", "a"]).into();
        assert_eq!(flat.hashes_to_lock(), vec!["a".to_string(), "b".to_string()]);
        assert!(hierarchical(1).hashes_to_lock().is_empty());
    }

    #[test]
    fn test_activity_payloads() {
        let flat: ReplacementSpec = FlatReplacement::new(["a"]).into();
        assert_eq!(
            flat.activity_payload(DEFAULT_UNMERGE_KEY),
            ActivityPayload::Fingerprints {
                fingerprints: vec!["a".to_string()]
            }
        );
        assert_eq!(
            hierarchical(1).activity_payload("b"),
            ActivityPayload::HierarchicalSplit {
                new_hierarchical_hash: "b".to_string()
            }
        );
    }

    #[test]
    fn test_serde_keeps_variant_tag() {
        let spec = hierarchical(2);
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("hierarchical").is_some());
        let back: ReplacementSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);

        let flat: ReplacementSpec = FlatReplacement::new(["a"]).into();
        let bytes = bincode::serialize(&flat).unwrap();
        let back: ReplacementSpec = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, flat);
    }

    #[tokio::test]
    async fn test_flat_reassignment_moves_locked_rows() {
        let table = InMemoryHashLockTable::new();
        table.insert(HashLockEntry::new(1, "a", 10).with_state(HashState::LockedForMigration));
        table.insert(HashLockEntry::new(1, "b", 10));

        let spec: ReplacementSpec = FlatReplacement::new(["a"]).into();
        spec.apply_row_reassignment(&table, 1, DEFAULT_UNMERGE_KEY, 20, &locked(&["a"]))
            .await
            .unwrap();

        assert_eq!(table.entry(1, "a").unwrap().group_id, 20);
        assert_eq!(table.entry(1, "b").unwrap().group_id, 10);
    }

    #[tokio::test]
    async fn test_hierarchical_reassignment_unlocks_split_rows() {
        let table = InMemoryHashLockTable::new();
        table.insert(HashLockEntry::new(1, "a", 10).with_state(HashState::Split));
        table.insert(HashLockEntry::new(1, "z", 10).with_state(HashState::LockedForMigration));

        let spec: ReplacementSpec = HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "a".to_string(),
            filter_level: 0,
            new_level: 1,
            assume_source_emptied: false,
            reset_hashes: vec!["a".to_string(), "z".to_string()],
        }
        .into();

        spec.apply_row_reassignment(&table, 1, "b", 30, &BTreeSet::new())
            .await
            .unwrap();
        // Running it twice leaves the same state.
        spec.apply_row_reassignment(&table, 1, "b", 30, &BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(table.entry(1, "a").unwrap().state, HashState::Unlocked);
        assert_eq!(
            table.entry(1, "z").unwrap().state,
            HashState::LockedForMigration
        );
        let new_row = table.entry(1, "b").unwrap();
        assert_eq!(new_row.group_id, 30);
        assert_eq!(new_row.state, HashState::Unlocked);
    }

    #[tokio::test]
    async fn test_on_complete_excludes_only_when_source_emptied() {
        let snapshots = InMemoryStreamSnapshots::new();

        hierarchical(1).on_complete(&snapshots, 1, 10).await.unwrap();
        assert!(!snapshots.is_excluded(1, 10));

        let emptied: ReplacementSpec = HierarchicalReplacement {
            primary_hash: "p".to_string(),
            filter_hash: "a".to_string(),
            filter_level: 0,
            new_level: 1,
            assume_source_emptied: true,
            reset_hashes: Vec::new(),
        }
        .into();
        emptied.on_complete(&snapshots, 1, 10).await.unwrap();
        emptied.on_complete(&snapshots, 1, 10).await.unwrap();
        assert!(snapshots.is_excluded(1, 10));
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        (
            prop_oneof![Just("p"), Just("q"), Just("x")],
            proptest::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c")], 0..5),
        )
            .prop_map(|(primary, hashes)| {
                Event::new("e", 1, 10, primary).with_hierarchical_hashes(hashes)
            })
    }

    fn arb_spec() -> impl Strategy<Value = ReplacementSpec> {
        prop_oneof![
            Just(ReplacementSpec::from(FlatReplacement::new(["p", "x"]))),
            (0usize..4, 0usize..6).prop_map(|(filter_level, new_level)| {
                ReplacementSpec::from(HierarchicalReplacement {
                    primary_hash: "p".to_string(),
                    filter_hash: "a".to_string(),
                    filter_level,
                    new_level,
                    assume_source_emptied: false,
                    reset_hashes: Vec::new(),
                })
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_decide_is_deterministic(
            spec in arb_spec(),
            event in arb_event(),
            lock_p in any::<bool>(),
        ) {
            let locked: BTreeSet<ContentHash> = if lock_p {
                locked(&["p", "x"])
            } else {
                locked(&["x"])
            };
            let first = spec.decide(&event, &locked);
            for _ in 0..3 {
                prop_assert_eq!(spec.decide(&event, &locked), first.clone());
            }
        }

        #[test]
        fn prop_hierarchical_key_comes_from_sequence(
            spec in arb_spec(),
            event in arb_event(),
        ) {
            if let (ReplacementSpec::Hierarchical(_), Some(key)) =
                (&spec, spec.decide(&event, &BTreeSet::new()))
            {
                prop_assert!(event.hierarchical_hashes.contains(&key));
            }
        }
    }
}

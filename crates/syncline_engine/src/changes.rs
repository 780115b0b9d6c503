//! Change classification.

use std::collections::BTreeMap;
use syncline_model::{ChangeKind, ChangeSet, DocumentChange, EntityId, Snapshot};

/// Classifies raw subscription pushes into {added, modified, removed} sets.
///
/// A pure function: no side effects, idempotent over the same input.
/// Derived-aggregate recomputation (summary fields over child entities and
/// the like) is explicitly the caller's job after it receives the classified
/// delta.
pub struct ChangeProcessor;

impl ChangeProcessor {
    /// Processes a raw delta.
    ///
    /// Changes to the same entity within one delta are coalesced to the net
    /// effect before classification:
    ///
    /// - added then modified → added (with the latest snapshot)
    /// - added or modified then removed → removed
    /// - removed then re-added → modified (the consumer still holds it)
    /// - repeated modifications keep only the latest snapshot
    ///
    /// Output within each set is ordered by entity id so consumers see a
    /// deterministic sequence regardless of push ordering.
    pub fn process(raw: &[DocumentChange]) -> ChangeSet {
        let mut net: BTreeMap<EntityId, (ChangeKind, Option<Snapshot>)> = BTreeMap::new();

        for change in raw {
            let entry = net.get(&change.entity_id).cloned();
            let next = match (entry, change.kind) {
                (None, kind) => (kind, change.snapshot.clone()),
                (Some((ChangeKind::Added, _)), ChangeKind::Modified) => {
                    (ChangeKind::Added, change.snapshot.clone())
                }
                (Some((ChangeKind::Removed, _)), ChangeKind::Added) => {
                    (ChangeKind::Modified, change.snapshot.clone())
                }
                (Some(_), ChangeKind::Removed) => (ChangeKind::Removed, None),
                (Some((kind, _)), ChangeKind::Added | ChangeKind::Modified) => {
                    (kind, change.snapshot.clone())
                }
            };
            net.insert(change.entity_id, next);
        }

        let mut set = ChangeSet::default();
        for (entity_id, (kind, snapshot)) in net {
            match (kind, snapshot) {
                (ChangeKind::Added, Some(snap)) => set.added.push((entity_id, snap)),
                (ChangeKind::Modified, Some(snap)) => set.modified.push((entity_id, snap)),
                (ChangeKind::Removed, _) => set.removed.push(entity_id),
                // Added/Modified without a snapshot cannot happen for
                // well-formed deltas; drop rather than invent a tombstone.
                _ => {}
            }
        }
        set
    }
}

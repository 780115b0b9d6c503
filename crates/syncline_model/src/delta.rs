//! Raw change deltas and classified change sets.

use crate::ids::EntityId;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

/// The kind of change reported for one entity in a subscription push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Entity newly matches the subscription.
    Added,
    /// Entity already matched and its content changed.
    Modified,
    /// Entity was deleted or stopped matching (tombstone).
    Removed,
}

/// A single raw change record pushed by the remote store.
///
/// `Removed` changes are tombstones: `snapshot` is `None`. Presence of a
/// tombstone is distinct from absence of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    /// The entity affected.
    pub entity_id: EntityId,
    /// The kind of change.
    pub kind: ChangeKind,
    /// The new snapshot, absent for tombstones.
    pub snapshot: Option<Snapshot>,
}

impl DocumentChange {
    /// Creates an added record.
    pub fn added(entity_id: EntityId, snapshot: Snapshot) -> Self {
        Self {
            entity_id,
            kind: ChangeKind::Added,
            snapshot: Some(snapshot),
        }
    }

    /// Creates a modified record.
    pub fn modified(entity_id: EntityId, snapshot: Snapshot) -> Self {
        Self {
            entity_id,
            kind: ChangeKind::Modified,
            snapshot: Some(snapshot),
        }
    }

    /// Creates a tombstone.
    pub fn removed(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            kind: ChangeKind::Removed,
            snapshot: None,
        }
    }
}

/// Classified output of the change processor.
///
/// Entities within each set are ordered by id so downstream consumers see a
/// deterministic sequence regardless of push ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Entities that newly match, with their snapshots.
    pub added: Vec<(EntityId, Snapshot)>,
    /// Entities whose content changed, with their new snapshots.
    pub modified: Vec<(EntityId, Snapshot)>,
    /// Entities removed (tombstoned).
    pub removed: Vec<EntityId>,
}

impl ChangeSet {
    /// Returns true if no changes were classified.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of classified changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

//! Pending mutations and per-entity coalescing.

use crate::ids::{CollectionId, EntityId};
use crate::snapshot::{FieldMap, Snapshot};
use serde::{Deserialize, Serialize};

/// The kind of mutation a client submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create a new entity.
    Create,
    /// Patch fields of an existing entity.
    Update,
    /// Delete an entity.
    Delete,
}

/// A mutation awaiting remote confirmation.
///
/// Created when a mutation is attempted while offline, or when an optimistic
/// submission has not yet been confirmed. Owned by the offline queue while
/// queued; handed to the conflict resolver during replay.
///
/// # Fields
///
/// - `id`: locally generated, monotonically increasing
/// - `original_snapshot`: the pre-mutation view, kept for rollback
/// - `last_error`: attached after a transient replay failure so the record
///   can be inspected while it waits for the next drain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Locally generated monotonic id.
    pub id: u64,
    /// Target collection.
    pub collection_id: CollectionId,
    /// Target entity.
    pub entity_id: EntityId,
    /// What the mutation does.
    pub kind: OperationKind,
    /// Fields the mutation writes (empty for deletes).
    pub payload: FieldMap,
    /// Pre-mutation snapshot for rollback, if the entity existed locally.
    pub original_snapshot: Option<Snapshot>,
    /// When the mutation was enqueued, in milliseconds since the epoch.
    pub enqueued_at_ms: u64,
    /// Error attached by the last failed replay attempt.
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Creates a new pending operation.
    pub fn new(
        id: u64,
        collection_id: CollectionId,
        entity_id: EntityId,
        kind: OperationKind,
        payload: FieldMap,
        original_snapshot: Option<Snapshot>,
        enqueued_at_ms: u64,
    ) -> Self {
        Self {
            id,
            collection_id,
            entity_id,
            kind,
            payload,
            original_snapshot,
            enqueued_at_ms,
            last_error: None,
        }
    }

    /// Folds a later queued mutation against the same entity into this one.
    ///
    /// Coalescing only applies to operations that are still queued, never to
    /// one already in flight. Rules:
    ///
    /// - update∘update and create∘update fold the later payload in, later
    ///   fields winning; the earlier id, rollback snapshot and enqueue time
    ///   are kept so the record still represents the first submission.
    /// - create∘delete cancels out entirely: the entity never existed
    ///   remotely, so there is nothing to delete.
    /// - update∘delete collapses to a delete.
    /// - anything after a delete cannot be folded and must stay a separate
    ///   queue entry behind it.
    pub fn coalesce(&mut self, later: PendingOperation) -> CoalesceResult {
        debug_assert_eq!(self.entity_id, later.entity_id);

        match (self.kind, later.kind) {
            (OperationKind::Delete, _) => CoalesceResult::Chain(later),
            (OperationKind::Create, OperationKind::Delete) => CoalesceResult::Cancelled,
            (_, OperationKind::Delete) => {
                self.kind = OperationKind::Delete;
                self.payload.clear();
                CoalesceResult::Merged
            }
            // create∘update keeps Create; update∘update keeps Update. A
            // create arriving after a queued create/update is treated as a
            // full overwrite and folded the same way.
            (_, _) => {
                for (name, value) in later.payload {
                    self.payload.insert(name, value);
                }
                CoalesceResult::Merged
            }
        }
    }
}

/// Result of folding a later operation into an earlier queued one.
#[derive(Debug, Clone, PartialEq)]
pub enum CoalesceResult {
    /// The later operation was absorbed into the earlier record.
    Merged,
    /// Both operations cancel out and neither needs submission.
    Cancelled,
    /// The later operation must be queued separately, in order.
    Chain(PendingOperation),
}

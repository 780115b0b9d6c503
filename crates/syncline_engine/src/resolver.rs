//! Optimistic mutation protocol and conflict resolution.
//!
//! Every submitted mutation moves through a small state machine:
//!
//! ```text
//! optimistic-applied → awaiting-confirmation → confirmed
//!                                            → conflicted
//!                                            → failed
//! ```
//!
//! The resolver owns the local view (the entity cache the UI reads). A
//! mutation is applied to the view immediately, the pre-mutation snapshot is
//! captured for rollback, and the remote write follows. Confirmation rides
//! the normal subscription pipeline: when the next server snapshot for the
//! entity arrives, the fields the mutation touched are compared against it.

use crate::error::{EngineError, EngineResult};
use crate::scheduler::batch_commit;
use crate::store::{RemoteStore, WriteOp, WriteReceipt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use syncline_model::{
    ChangeSet, CollectionId, ConflictOutcome, ConflictRecord, EntityId, FieldMap, OperationKind,
    PendingOperation, Snapshot,
};
use tracing::{debug, warn};

/// Handle for one submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationTicket(pub u64);

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Applied locally; not yet submitted (offline) or submission pending.
    OptimisticApplied,
    /// Submitted; waiting for the server-confirmed snapshot.
    AwaitingConfirmation,
    /// Server confirmed the touched fields exactly.
    Confirmed,
    /// Server diverged; resolved automatically (see the outcome's value).
    Conflicted,
    /// Submission failed hard; the local view was rolled back.
    Failed,
}

impl MutationState {
    /// Returns true if the mutation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MutationState::Confirmed | MutationState::Conflicted | MutationState::Failed
        )
    }
}

/// The caller-visible result of a mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Current state.
    pub state: MutationState,
    /// The value the entity converged to, when terminal. `None` for deletes
    /// and failures.
    pub final_value: Option<Snapshot>,
    /// The error, for failed mutations.
    pub error: Option<EngineError>,
}

struct MutationRecord {
    collection_id: CollectionId,
    entity_id: EntityId,
    kind: OperationKind,
    patch: FieldMap,
    original: Option<Snapshot>,
    state: MutationState,
    /// Server-assigned timestamp of our write, once known.
    write_timestamp_ms: Option<u64>,
    /// Confirmation deadline.
    deadline_ms: Option<u64>,
    rolled_back: bool,
    final_value: Option<Snapshot>,
    error: Option<EngineError>,
}

/// Terminal records kept around for status polling before eviction.
const SETTLED_HISTORY: usize = 256;

struct RecordTable {
    records: HashMap<u64, MutationRecord>,
    /// Absorbing op id → tickets whose queued operations coalesced into it.
    absorbed: HashMap<u64, Vec<u64>>,
    /// Settled tickets, oldest first, for bounded eviction.
    settled: VecDeque<u64>,
}

/// Moves a record to a terminal state, settles every ticket absorbed into
/// it with the same outcome, and evicts the oldest settled records past the
/// history bound.
fn settle(
    table: &mut RecordTable,
    id: u64,
    state: MutationState,
    final_value: Option<Snapshot>,
    error: Option<EngineError>,
) {
    {
        let Some(record) = table.records.get_mut(&id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        record.state = state;
        record.final_value = final_value.clone();
        record.error = error.clone();
    }
    table.settled.push_back(id);

    for follower in table.absorbed.remove(&id).unwrap_or_default() {
        settle(table, follower, state, final_value.clone(), error.clone());
    }

    while table.settled.len() > SETTLED_HISTORY {
        if let Some(oldest) = table.settled.pop_front() {
            table.records.remove(&oldest);
        }
    }
}

/// Executes the optimistic-update protocol and resolves divergence.
pub struct ConflictResolver {
    store: Arc<dyn RemoteStore>,
    confirmation_timeout: Duration,
    view: Mutex<HashMap<(CollectionId, EntityId), Snapshot>>,
    records: Mutex<RecordTable>,
}

impl ConflictResolver {
    /// Creates a resolver writing through the given store.
    pub fn new(store: Arc<dyn RemoteStore>, confirmation_timeout: Duration) -> Self {
        Self {
            store,
            confirmation_timeout,
            view: Mutex::new(HashMap::new()),
            records: Mutex::new(RecordTable {
                records: HashMap::new(),
                absorbed: HashMap::new(),
                settled: VecDeque::new(),
            }),
        }
    }

    /// Returns the local view of an entity, if cached.
    pub fn local_view(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
    ) -> Option<Snapshot> {
        self.view.lock().get(&(collection_id, entity_id)).cloned()
    }

    /// Returns the caller-visible outcome for a ticket.
    ///
    /// Settled outcomes are kept for a bounded history; `None` means the
    /// ticket is unknown or its outcome was long since evicted.
    pub fn outcome(&self, ticket: MutationTicket) -> Option<MutationOutcome> {
        self.records
            .lock()
            .records
            .get(&ticket.0)
            .map(|r| MutationOutcome {
                state: r.state,
                final_value: r.final_value.clone(),
                error: r.error.clone(),
            })
    }

    /// Applies a mutation to the local view and starts tracking it.
    ///
    /// Returns the captured pre-mutation snapshot (the rollback point).
    pub fn begin(
        &self,
        ticket: MutationTicket,
        collection_id: CollectionId,
        entity_id: EntityId,
        kind: OperationKind,
        patch: FieldMap,
    ) -> Option<Snapshot> {
        let key = (collection_id, entity_id);
        let original = {
            let mut view = self.view.lock();
            let original = view.get(&key).cloned();
            match kind {
                OperationKind::Create | OperationKind::Update => {
                    let mut snapshot = original.clone().unwrap_or_else(Snapshot::empty);
                    snapshot.apply_patch(&patch);
                    view.insert(key, snapshot);
                }
                OperationKind::Delete => {
                    view.remove(&key);
                }
            }
            original
        };

        self.records.lock().records.insert(
            ticket.0,
            MutationRecord {
                collection_id,
                entity_id,
                kind,
                patch,
                original: original.clone(),
                state: MutationState::OptimisticApplied,
                write_timestamp_ms: None,
                deadline_ms: None,
                rolled_back: false,
                final_value: None,
                error: None,
            },
        );
        original
    }

    /// Ties a ticket whose queued operation coalesced into another queued
    /// operation to that absorbing operation's fate.
    ///
    /// The absorbed mutation never submits under its own id; it settles
    /// when the absorbing one settles, with the same outcome.
    pub fn absorb(&self, absorbed: MutationTicket, absorber: MutationTicket) {
        let mut table = self.records.lock();
        let done = table.records.get(&absorber.0).and_then(|r| {
            r.state
                .is_terminal()
                .then(|| (r.state, r.final_value.clone(), r.error.clone()))
        });
        match done {
            Some((state, final_value, error)) => {
                settle(&mut table, absorbed.0, state, final_value, error);
            }
            None => table
                .absorbed
                .entry(absorber.0)
                .or_default()
                .push(absorbed.0),
        }
    }

    /// Settles a create/delete pair that cancelled out in the queue.
    ///
    /// Nothing reaches the store, and nothing needs to: the net effect both
    /// callers asked for already holds, so both mutations confirm with no
    /// final value.
    pub fn settle_cancelled(&self, delete: MutationTicket, create: MutationTicket) {
        let mut table = self.records.lock();
        settle(&mut table, create.0, MutationState::Confirmed, None, None);
        settle(&mut table, delete.0, MutationState::Confirmed, None, None);
    }

    /// Submits a tracked mutation to the remote store.
    ///
    /// On success the mutation moves to awaiting-confirmation. A transient
    /// error is returned for the caller to queue; the mutation stays
    /// optimistic-applied. A permanent error fails the mutation, rolling
    /// the view back, and is returned.
    pub fn submit(&self, ticket: MutationTicket, now_ms: u64) -> EngineResult<()> {
        let (collection_id, entity_id, kind, patch) = {
            let table = self.records.lock();
            let record = table
                .records
                .get(&ticket.0)
                .ok_or(EngineError::UnknownTicket(ticket.0))?;
            (
                record.collection_id,
                record.entity_id,
                record.kind,
                record.patch.clone(),
            )
        };

        match self.store.write(collection_id, entity_id, kind, &patch) {
            Ok(receipt) => {
                self.note_submitted(ticket, receipt, now_ms);
                Ok(())
            }
            Err(store_err) => {
                let err: EngineError = store_err.into();
                if err.is_transient() {
                    Err(err)
                } else {
                    self.fail(ticket, err.clone());
                    Err(err)
                }
            }
        }
    }

    /// Replays a wave of queued operations (the drain executor).
    ///
    /// Records may not exist when the operations were journaled by a
    /// previous process run; they are created so confirmation still works.
    /// The queued payload wins over whatever a record held: coalescing may
    /// have folded later mutations in. The wave holds one operation per
    /// entity, so it goes to the store through its batch path when the
    /// store has one. One result is returned per operation, in order.
    pub fn replay_batch(
        &self,
        ops: &[PendingOperation],
        now_ms: u64,
    ) -> Vec<EngineResult<()>> {
        {
            let mut table = self.records.lock();
            for op in ops {
                match table.records.get_mut(&op.id) {
                    Some(record) => {
                        record.kind = op.kind;
                        record.patch = op.payload.clone();
                    }
                    None => {
                        table.records.insert(
                            op.id,
                            MutationRecord {
                                collection_id: op.collection_id,
                                entity_id: op.entity_id,
                                kind: op.kind,
                                patch: op.payload.clone(),
                                original: op.original_snapshot.clone(),
                                state: MutationState::OptimisticApplied,
                                write_timestamp_ms: None,
                                deadline_ms: None,
                                rolled_back: false,
                                final_value: None,
                                error: None,
                            },
                        );
                    }
                }
            }
        }

        let writes: Vec<WriteOp> = ops
            .iter()
            .map(|op| WriteOp {
                collection_id: op.collection_id,
                entity_id: op.entity_id,
                kind: op.kind,
                patch: op.payload.clone(),
            })
            .collect();

        batch_commit(self.store.as_ref(), &writes)
            .into_iter()
            .zip(ops)
            .map(|(result, op)| {
                let ticket = MutationTicket(op.id);
                match result {
                    Ok(receipt) => {
                        self.note_submitted(ticket, receipt, now_ms);
                        Ok(())
                    }
                    Err(store_err) => {
                        let err: EngineError = store_err.into();
                        if err.is_permanent() {
                            self.fail(ticket, err.clone());
                        }
                        Err(err)
                    }
                }
            })
            .collect()
    }

    /// Feeds a classified, server-confirmed delta through the resolver.
    ///
    /// Updates the local view and performs confirmation matching for every
    /// awaiting mutation touching the delta's entities. Called by the
    /// engine before the delta is dispatched to view callbacks.
    pub fn observe_changes(&self, collection_id: CollectionId, set: &ChangeSet) {
        for (entity_id, snapshot) in set.added.iter().chain(set.modified.iter()) {
            self.observe_snapshot(collection_id, *entity_id, snapshot);
        }
        for entity_id in &set.removed {
            self.observe_tombstone(collection_id, *entity_id);
        }
    }

    /// Fails a mutation, rolling the local view back to the captured
    /// pre-mutation snapshot. Rollback is idempotent: a second call for the
    /// same ticket detects no pending delta and changes nothing.
    pub fn fail(&self, ticket: MutationTicket, error: EngineError) {
        let mut table = self.records.lock();
        {
            let Some(record) = table.records.get_mut(&ticket.0) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }

            if !record.rolled_back {
                let key = (record.collection_id, record.entity_id);
                let mut view = self.view.lock();
                match &record.original {
                    Some(snapshot) => {
                        view.insert(key, snapshot.clone());
                    }
                    None => {
                        view.remove(&key);
                    }
                }
                record.rolled_back = true;
            }
        }
        settle(&mut table, ticket.0, MutationState::Failed, None, Some(error));
    }

    /// Promotes overdue confirmations to optimistic success.
    ///
    /// A confirmation that never arrives within the bounded wait is treated
    /// as confirmed rather than blocking forever. Returns the promoted
    /// tickets.
    pub fn tick(&self, now_ms: u64) -> Vec<MutationTicket> {
        let mut promoted = Vec::new();
        let mut table = self.records.lock();

        let overdue: Vec<u64> = table
            .records
            .iter()
            .filter(|(_, record)| {
                record.state == MutationState::AwaitingConfirmation
                    && record.deadline_ms.is_some_and(|deadline| deadline <= now_ms)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in overdue {
            let final_value = {
                let Some(record) = table.records.get(&id) else {
                    continue;
                };
                debug!(
                    ticket = id,
                    entity = %record.entity_id,
                    "confirmation window elapsed, assuming success"
                );
                self.view
                    .lock()
                    .get(&(record.collection_id, record.entity_id))
                    .cloned()
            };
            settle(&mut table, id, MutationState::Confirmed, final_value, None);
            promoted.push(MutationTicket(id));
        }
        promoted
    }

    fn note_submitted(&self, ticket: MutationTicket, receipt: WriteReceipt, now_ms: u64) {
        let mut table = self.records.lock();
        let Some(record) = table.records.get_mut(&ticket.0) else {
            return;
        };
        record.state = MutationState::AwaitingConfirmation;
        record.write_timestamp_ms = Some(receipt.server_timestamp_ms);
        record.deadline_ms = Some(now_ms + self.confirmation_timeout.as_millis() as u64);

        // Our write's server timestamp becomes the view's timestamp; later
        // pushes compare against it for last-writer-wins.
        if record.kind != OperationKind::Delete {
            let key = (record.collection_id, record.entity_id);
            let mut view = self.view.lock();
            if let Some(snapshot) = view.get(&key).cloned() {
                view.insert(key, snapshot.with_timestamp(receipt.server_timestamp_ms));
            }
        }
    }

    fn observe_snapshot(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
        snapshot: &Snapshot,
    ) {
        self.view
            .lock()
            .insert((collection_id, entity_id), snapshot.clone());

        // Confirmation matching, then any resubmission outside the lock.
        let mut resubmit: Option<(MutationTicket, Snapshot)> = None;
        {
            let mut table = self.records.lock();
            let awaiting: Vec<u64> = table
                .records
                .iter()
                .filter(|(_, record)| {
                    record.entity_id == entity_id
                        && record.collection_id == collection_id
                        && record.state == MutationState::AwaitingConfirmation
                        && record.kind != OperationKind::Delete
                })
                .map(|(id, _)| *id)
                .collect();

            for id in awaiting {
                let (state, final_value, winning) = {
                    let Some(record) = table.records.get(&id) else {
                        continue;
                    };

                    if snapshot.matches_patch(&record.patch) {
                        (MutationState::Confirmed, Some(snapshot.clone()), None)
                    } else {
                        // Divergence on the touched fields.
                        let mut local =
                            record.original.clone().unwrap_or_else(Snapshot::empty);
                        local.apply_patch(&record.patch);
                        let local =
                            local.with_timestamp(record.write_timestamp_ms.unwrap_or(0));

                        let conflict =
                            ConflictRecord::resolve(entity_id, local, snapshot.clone());
                        debug!(
                            ticket = id,
                            entity = %entity_id,
                            outcome = ?conflict.outcome,
                            "resolved divergence"
                        );

                        let final_value = if conflict.outcome == ConflictOutcome::ServerWins {
                            Some(snapshot.clone())
                        } else {
                            Some(conflict.resolved.clone())
                        };
                        let winning = conflict
                            .needs_resubmit()
                            .then(|| conflict.resolved.clone());
                        (MutationState::Conflicted, final_value, winning)
                    }
                };

                if let Some(resolved) = winning {
                    resubmit = Some((MutationTicket(id), resolved));
                }
                settle(&mut table, id, state, final_value, None);
            }
        }

        if let Some((ticket, resolved)) = resubmit {
            self.reassert(ticket, collection_id, entity_id, resolved);
        }
    }

    fn observe_tombstone(&self, collection_id: CollectionId, entity_id: EntityId) {
        self.view.lock().remove(&(collection_id, entity_id));

        let mut table = self.records.lock();
        let awaiting: Vec<(u64, OperationKind)> = table
            .records
            .iter()
            .filter(|(_, record)| {
                record.entity_id == entity_id
                    && record.collection_id == collection_id
                    && record.state == MutationState::AwaitingConfirmation
            })
            .map(|(id, record)| (*id, record.kind))
            .collect();

        for (id, kind) in awaiting {
            let state = if kind == OperationKind::Delete {
                MutationState::Confirmed
            } else {
                // Server deleted the entity out from under our update; the
                // server's deletion stands.
                MutationState::Conflicted
            };
            settle(&mut table, id, state, None, None);
        }
    }

    /// Re-submits a resolved value to reassert the winning local write.
    fn reassert(
        &self,
        ticket: MutationTicket,
        collection_id: CollectionId,
        entity_id: EntityId,
        resolved: Snapshot,
    ) {
        let patch = resolved.fields().clone();
        match self
            .store
            .write(collection_id, entity_id, OperationKind::Update, &patch)
        {
            Ok(receipt) => {
                self.view.lock().insert(
                    (collection_id, entity_id),
                    resolved.with_timestamp(receipt.server_timestamp_ms),
                );
            }
            Err(err) => {
                // Reasserting is best-effort; the resolved value already
                // stands locally and the next push reconciles again.
                warn!(ticket = ticket.0, entity = %entity_id, %err, "reassert failed");
                self.view
                    .lock()
                    .insert((collection_id, entity_id), resolved);
            }
        }
    }
}

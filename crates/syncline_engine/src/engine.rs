//! The engine facade.
//!
//! Wires the monitor, registry, scheduler, queue and resolver together
//! behind one handle. The engine is tick-driven: the host calls
//! [`SyncEngine::tick`] from its event loop (or a timer) and every
//! time-based behavior (connection probing, debounce windows, confirmation
//! deadlines) advances from the injected [`Clock`]. Nothing inside spawns
//! threads or sleeps outside of drain backoff.

use crate::changes::ChangeProcessor;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::connection::{ConnectionMonitor, ConnectionState, ListenerToken};
use crate::error::{EngineError, EngineResult};
use crate::queue::{EnqueueOutcome, OfflineQueue, QueueStore};
use crate::registry::{
    DeliverHook, ErrorCallback, SubscriptionHandle, SubscriptionRegistry, ViewCallback,
};
use crate::resolver::{ConflictResolver, MutationOutcome, MutationTicket};
use crate::scheduler::UpdateScheduler;
use crate::store::{Filter, RemoteStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use syncline_model::{
    CollectionId, DocumentChange, EntityId, FieldMap, OperationKind, PendingOperation, Snapshot,
};
use tracing::{info, warn};

/// Client-side synchronization engine for a document-oriented remote store.
///
/// All methods take `&self`; the engine is internally synchronized and may
/// be shared across threads behind an `Arc`.
pub struct SyncEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    monitor: Arc<ConnectionMonitor>,
    registry: Arc<SubscriptionRegistry>,
    scheduler: Arc<UpdateScheduler<DocumentChange>>,
    queue: Arc<OfflineQueue>,
    resolver: Arc<ConflictResolver>,
    running: AtomicBool,
    next_op_id: AtomicU64,
    drain_listener: Mutex<Option<ListenerToken>>,
}

impl SyncEngine {
    /// Builds an engine over the given store, clock and queue journal.
    ///
    /// Fails if the queue journal exists but cannot be read.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        queue_store: Arc<dyn QueueStore>,
    ) -> EngineResult<Self> {
        let scheduler: Arc<UpdateScheduler<DocumentChange>> = Arc::new(UpdateScheduler::new());

        let deliver: DeliverHook = {
            let scheduler = Arc::clone(&scheduler);
            let clock = Arc::clone(&clock);
            let window = config.debounce_window;
            Arc::new(move |key, changes| {
                scheduler.debounce(key, changes, window, clock.now_ms());
            })
        };

        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&store), deliver));
        let monitor = Arc::new(ConnectionMonitor::new(
            Arc::clone(&store),
            config.probe_target,
            config.probe_interval,
        ));
        let queue = Arc::new(OfflineQueue::open(queue_store)?);
        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&store),
            config.confirmation_timeout,
        ));

        Ok(Self {
            config,
            clock,
            monitor,
            registry,
            scheduler,
            queue,
            resolver,
            running: AtomicBool::new(false),
            next_op_id: AtomicU64::new(1),
            drain_listener: Mutex::new(None),
        })
    }

    /// Starts the engine: probes connectivity once and arms the reconnect
    /// handler that reopens queries and drains the queue. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = {
            let registry = Arc::clone(&self.registry);
            let queue = Arc::clone(&self.queue);
            let resolver = Arc::clone(&self.resolver);
            let clock = Arc::clone(&self.clock);
            let retry = self.config.retry.clone();
            self.monitor.on_state_change(move |state| {
                if state != ConnectionState::Online {
                    return;
                }
                // Reopen queries first so the post-drain pushes land on
                // live subscriptions.
                registry.reopen_all();
                let mut replay =
                    |ops: &[PendingOperation]| resolver.replay_batch(ops, clock.now_ms());
                match queue.drain(&mut replay, &retry) {
                    Ok(report) if report.is_clean() => {}
                    Ok(report) => warn!(
                        failed = report.failed.len(),
                        dropped = report.dropped.len(),
                        "queue drain finished with failures"
                    ),
                    Err(err) => warn!(%err, "queue drain aborted"),
                }
            })
        };
        *self.drain_listener.lock() = Some(token);

        self.monitor.probe_now(self.clock.now_ms());

        // Journaled mutations from a previous run replay as soon as the
        // store is reachable; the first probe sets the baseline without a
        // transition, so the reconnect handler alone would never see them.
        if self.monitor.state() == ConnectionState::Online && !self.queue.is_empty() {
            let mut replay =
                |ops: &[PendingOperation]| self.resolver.replay_batch(ops, self.clock.now_ms());
            match self.queue.drain(&mut replay, &self.config.retry) {
                Ok(report) if report.is_clean() => {}
                Ok(report) => warn!(
                    failed = report.failed.len(),
                    dropped = report.dropped.len(),
                    "startup drain finished with failures"
                ),
                Err(err) => warn!(%err, "startup drain aborted"),
            }
        }
        info!(queued = self.queue.len(), "engine started");
    }

    /// Stops the engine: closes every live query and disarms the reconnect
    /// handler. Queued mutations stay journaled for the next start.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.drain_listener.lock().take() {
            self.monitor.remove_listener(token);
        }
        self.registry.close_all();
        info!("engine stopped");
    }

    /// Advances every time-based behavior to the clock's current instant.
    ///
    /// Runs due connection probes, fires elapsed debounce windows (feeding
    /// the classified deltas through conflict resolution, then to view
    /// callbacks), and promotes overdue confirmations.
    pub fn tick(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let now = self.clock.now_ms();
        self.monitor.probe_if_due(now);

        for (key, raw) in self.scheduler.take_due(now) {
            let set = ChangeProcessor::process(&raw);
            if set.is_empty() {
                continue;
            }
            if let Some(collection_id) = self.registry.query_collection(&key) {
                self.resolver.observe_changes(collection_id, &set);
            }
            self.registry.dispatch(&key, &set);
        }

        self.resolver.tick(now);
    }

    /// Attaches a view to a live query over (collection, filter).
    ///
    /// The callback receives classified deltas after debouncing. Identical
    /// queries share one underlying subscription.
    pub fn register_view(
        &self,
        collection_id: CollectionId,
        filter: Filter,
        callback: ViewCallback,
    ) -> EngineResult<SubscriptionHandle> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        self.registry.subscribe(collection_id, filter, callback)
    }

    /// Attaches a view that also hears about a later permanent rejection
    /// of its query (access revoked while offline, discovered on the
    /// reconnect reopen).
    pub fn register_view_with_errors(
        &self,
        collection_id: CollectionId,
        filter: Filter,
        callback: ViewCallback,
        on_error: ErrorCallback,
    ) -> EngineResult<SubscriptionHandle> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        self.registry
            .subscribe_with_errors(collection_id, filter, callback, on_error)
    }

    /// Detaches a view.
    pub fn unregister_view(&self, handle: SubscriptionHandle) {
        self.registry.unsubscribe(handle);
    }

    /// Submits a mutation optimistically.
    ///
    /// The local view reflects the mutation before this returns. While
    /// offline the mutation is journaled and replayed on reconnect; while
    /// online it is written through immediately, falling back to the queue
    /// on a transient failure. Only a permanent rejection returns an error,
    /// after rolling the local view back.
    pub fn submit_mutation(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
        kind: OperationKind,
        payload: FieldMap,
    ) -> EngineResult<MutationTicket> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }

        let id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        let ticket = MutationTicket(id);
        let now = self.clock.now_ms();
        let original =
            self.resolver
                .begin(ticket, collection_id, entity_id, kind, payload.clone());

        // Degraded counts as online: the last confirmed state was online
        // and a failed attempt just lands in the queue anyway.
        if self.monitor.state() == ConnectionState::Offline {
            self.queue_mutation(
                ticket,
                PendingOperation::new(id, collection_id, entity_id, kind, payload, original, now),
            )?;
            return Ok(ticket);
        }

        match self.resolver.submit(ticket, now) {
            Ok(()) => Ok(ticket),
            Err(err) if err.is_transient() => {
                self.queue_mutation(
                    ticket,
                    PendingOperation::new(
                        id,
                        collection_id,
                        entity_id,
                        kind,
                        payload,
                        original,
                        now,
                    ),
                )?;
                Ok(ticket)
            }
            Err(err) => Err(err),
        }
    }

    /// Queues a mutation for later replay, settling its ticket against the
    /// absorbing entry when coalescing swallowed the operation.
    fn queue_mutation(&self, ticket: MutationTicket, op: PendingOperation) -> EngineResult<()> {
        match self.queue.enqueue(op)? {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::MergedInto(absorber) => {
                self.resolver.absorb(ticket, MutationTicket(absorber));
            }
            EnqueueOutcome::CancelledWith(create) => {
                self.resolver.settle_cancelled(ticket, MutationTicket(create));
            }
        }
        Ok(())
    }

    /// Returns the current outcome for a mutation ticket.
    pub fn mutation_status(&self, ticket: MutationTicket) -> Option<MutationOutcome> {
        self.resolver.outcome(ticket)
    }

    /// Returns the local view of an entity, optimistic mutations included.
    pub fn local_view(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
    ) -> Option<Snapshot> {
        self.resolver.local_view(collection_id, entity_id)
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// Registers a listener for confirmed connection transitions.
    pub fn on_connection_change(
        &self,
        listener: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.monitor.on_state_change(listener)
    }

    /// Removes a connection listener.
    pub fn remove_connection_listener(&self, token: ListenerToken) {
        self.monitor.remove_listener(token);
    }

    /// Number of mutations waiting in the offline queue.
    pub fn pending_mutations(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryPolicy;
    use crate::queue::MemoryQueueStore;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    const COLLECTION: CollectionId = CollectionId(1);

    fn fields(quality: i64) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("quality".to_string(), json!(quality));
        map
    }

    fn engine(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> SyncEngine {
        let config = EngineConfig::new().with_retry(RetryPolicy::no_retry());
        SyncEngine::new(
            config,
            Arc::clone(store) as Arc<dyn RemoteStore>,
            Arc::clone(clock) as Arc<dyn Clock>,
            Arc::new(MemoryQueueStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn stopped_engine_rejects_calls() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_at(0));
        let engine = engine(&store, &clock);

        let err = engine
            .submit_mutation(COLLECTION, EntityId(1), OperationKind::Create, fields(1))
            .unwrap_err();
        assert_eq!(err, EngineError::Stopped);
    }

    #[test]
    fn online_mutation_writes_through() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_at(0));
        let engine = engine(&store, &clock);
        engine.start();

        engine
            .submit_mutation(COLLECTION, EntityId(1), OperationKind::Create, fields(4))
            .unwrap();

        assert_eq!(engine.pending_mutations(), 0);
        assert_eq!(
            store.snapshot(COLLECTION, EntityId(1)).unwrap().get("quality"),
            Some(&json!(4))
        );
    }

    #[test]
    fn start_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_at(0));
        let engine = engine(&store, &clock);

        engine.start();
        engine.start();
        engine.stop();
        engine.stop();
    }

    #[test]
    fn permanent_rejection_surfaces_and_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_at(0));
        let engine = engine(&store, &clock);
        engine.start();

        store.reject_writes(EntityId(9), crate::store::StoreError::InvalidPayload("bad".into()));
        let err = engine
            .submit_mutation(COLLECTION, EntityId(9), OperationKind::Create, fields(1))
            .unwrap_err();

        assert!(err.is_permanent());
        assert!(engine.local_view(COLLECTION, EntityId(9)).is_none());
        assert_eq!(engine.pending_mutations(), 0);
    }
}

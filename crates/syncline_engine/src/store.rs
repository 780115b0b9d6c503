//! Remote store abstraction.
//!
//! The remote document store is an external collaborator: an opaque service
//! exposing subscribe/read/write/batch-write with server-assigned
//! timestamps. The trait is the seam; [`MemoryStore`] is the scriptable
//! double used throughout the engine's tests.

use crate::error::EngineError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use syncline_model::{
    CollectionId, DocumentChange, EntityId, FieldMap, OperationKind, Snapshot,
};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Typed errors from the remote store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store or the network is unreachable.
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The server rejected the payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The entity does not exist.
    #[error("no such entity {entity_id} in {collection_id}")]
    NotFound {
        /// Collection probed.
        collection_id: CollectionId,
        /// Entity probed.
        entity_id: EntityId,
    },

    /// The store has no atomic multi-write.
    #[error("batch writes not supported")]
    BatchUnsupported,
}

impl StoreError {
    /// Returns true if the error is a network-class failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => EngineError::Connectivity(msg),
            StoreError::PermissionDenied(msg) => EngineError::Permission(msg),
            StoreError::InvalidPayload(msg) => EngineError::Validation(msg),
            StoreError::NotFound { .. } => EngineError::Validation(err.to_string()),
            StoreError::BatchUnsupported => {
                EngineError::Validation("batch writes not supported".into())
            }
        }
    }
}

/// Receipt for a confirmed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// The server-assigned timestamp for the write, in milliseconds.
    pub server_timestamp_ms: u64,
}

/// Identifies an open live query on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

/// A filter over entities within a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every entity in the collection.
    All,
    /// Entities whose field equals the given value.
    FieldEquals {
        /// Field name.
        field: String,
        /// Required value.
        value: serde_json::Value,
    },
}

impl Filter {
    /// Returns true if the snapshot matches this filter.
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        match self {
            Filter::All => true,
            Filter::FieldEquals { field, value } => snapshot.get(field) == Some(value),
        }
    }

    /// Canonical key form, used to dedupe live queries.
    pub fn key(&self) -> String {
        match self {
            Filter::All => "*".to_string(),
            Filter::FieldEquals { field, value } => format!("{field}={value}"),
        }
    }
}

/// A single write in a batch commit.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    /// Target collection.
    pub collection_id: CollectionId,
    /// Target entity.
    pub entity_id: EntityId,
    /// What the write does.
    pub kind: OperationKind,
    /// Fields written (empty for deletes).
    pub patch: FieldMap,
}

/// Receives raw change pushes for one live query.
pub type ChangeSink = Arc<dyn Fn(Vec<DocumentChange>) + Send + Sync>;

/// The remote document store, as consumed by the engine.
pub trait RemoteStore: Send + Sync {
    /// Opens a live query. The sink receives the initial matching set as
    /// added records, then incremental changes as they happen.
    fn subscribe(
        &self,
        collection_id: CollectionId,
        filter: &Filter,
        sink: ChangeSink,
    ) -> StoreResult<QueryId>;

    /// Closes a live query. Pushes already in flight are not recalled.
    fn unsubscribe(&self, query_id: QueryId);

    /// Reads one entity.
    fn read(&self, collection_id: CollectionId, entity_id: EntityId) -> StoreResult<Snapshot>;

    /// Writes one entity and returns the server-assigned timestamp.
    fn write(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
        kind: OperationKind,
        patch: &FieldMap,
    ) -> StoreResult<WriteReceipt>;

    /// Submits a set of independent writes as one unit.
    ///
    /// Fails with [`StoreError::BatchUnsupported`] when the store has no
    /// atomic multi-write; callers then fall back to sequential writes.
    fn batch_write(&self, ops: &[WriteOp]) -> StoreResult<Vec<StoreResult<WriteReceipt>>>;
}

struct SubEntry {
    collection_id: CollectionId,
    filter: Filter,
    sink: ChangeSink,
}

/// An in-memory remote store for tests.
///
/// Models the server plus the network link: an `offline` flag makes every
/// call fail with [`StoreError::Unavailable`], per-entity rejections script
/// permanent failures, and [`MemoryStore::upsert_remote`] plays the part of
/// another client whose writes arrive as live pushes.
pub struct MemoryStore {
    docs: Mutex<HashMap<(CollectionId, EntityId), Snapshot>>,
    subs: Mutex<HashMap<QueryId, SubEntry>>,
    next_query_id: AtomicU64,
    server_time_ms: AtomicU64,
    offline: AtomicBool,
    denied_collections: Mutex<HashSet<CollectionId>>,
    write_rejections: Mutex<HashMap<EntityId, StoreError>>,
    batch_supported: AtomicBool,
    write_log: Mutex<Vec<WriteOp>>,
}

impl MemoryStore {
    /// Creates an empty, online store.
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
            server_time_ms: AtomicU64::new(1_000),
            offline: AtomicBool::new(false),
            denied_collections: Mutex::new(HashSet::new()),
            write_rejections: Mutex::new(HashMap::new()),
            batch_supported: AtomicBool::new(true),
            write_log: Mutex::new(Vec::new()),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Sets the server clock used to stamp writes.
    pub fn set_server_time(&self, ms: u64) {
        self.server_time_ms.store(ms, Ordering::SeqCst);
    }

    /// Makes `subscribe` fail with a permission error for a collection.
    pub fn deny_collection(&self, collection_id: CollectionId) {
        self.denied_collections.lock().insert(collection_id);
    }

    /// Scripts a failure for every write against one entity.
    pub fn reject_writes(&self, entity_id: EntityId, error: StoreError) {
        self.write_rejections.lock().insert(entity_id, error);
    }

    /// Clears a scripted write failure.
    pub fn allow_writes(&self, entity_id: EntityId) {
        self.write_rejections.lock().remove(&entity_id);
    }

    /// Disables atomic multi-write.
    pub fn set_batch_supported(&self, supported: bool) {
        self.batch_supported.store(supported, Ordering::SeqCst);
    }

    /// Returns every write accepted so far, in order.
    pub fn writes(&self) -> Vec<WriteOp> {
        self.write_log.lock().clone()
    }

    /// Returns the stored snapshot for an entity, if any.
    pub fn snapshot(&self, collection_id: CollectionId, entity_id: EntityId) -> Option<Snapshot> {
        self.docs.lock().get(&(collection_id, entity_id)).cloned()
    }

    /// Applies another client's write server-side.
    ///
    /// The change is pushed to matching live queries only while this client
    /// is online; a disconnected client misses it entirely and only catches
    /// up through the initial set on re-subscribe.
    pub fn upsert_remote(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
        fields: FieldMap,
        server_timestamp_ms: u64,
    ) {
        let notifications = {
            let mut docs = self.docs.lock();
            let key = (collection_id, entity_id);
            let existed = docs.contains_key(&key);
            let mut snapshot = docs.get(&key).cloned().unwrap_or_else(Snapshot::empty);
            snapshot.apply_patch(&fields);
            let snapshot = snapshot.with_timestamp(server_timestamp_ms);
            docs.insert(key, snapshot.clone());
            self.matching_sinks(collection_id, entity_id, &snapshot, existed)
        };

        if !self.offline.load(Ordering::SeqCst) {
            for (sink, change) in notifications {
                sink(vec![change]);
            }
        }
    }

    /// Deletes an entity server-side, pushing a tombstone.
    pub fn delete_remote(&self, collection_id: CollectionId, entity_id: EntityId) {
        let notifications = {
            let mut docs = self.docs.lock();
            if docs.remove(&(collection_id, entity_id)).is_none() {
                return;
            }
            let subs = self.subs.lock();
            subs.values()
                .filter(|s| s.collection_id == collection_id)
                .map(|s| (Arc::clone(&s.sink), DocumentChange::removed(entity_id)))
                .collect::<Vec<_>>()
        };

        if !self.offline.load(Ordering::SeqCst) {
            for (sink, change) in notifications {
                sink(vec![change]);
            }
        }
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("network down".into()))
        } else {
            Ok(())
        }
    }

    fn stamp(&self) -> u64 {
        self.server_time_ms.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Collects (sink, change) pairs for a changed snapshot. `existed`
    /// decides added vs modified per subscription filter membership.
    fn matching_sinks(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
        snapshot: &Snapshot,
        existed: bool,
    ) -> Vec<(ChangeSink, DocumentChange)> {
        let subs = self.subs.lock();
        subs.values()
            .filter(|s| s.collection_id == collection_id)
            .filter_map(|s| {
                let matches_now = s.filter.matches(snapshot);
                let change = match (existed, matches_now) {
                    (false, true) => DocumentChange::added(entity_id, snapshot.clone()),
                    (true, true) => DocumentChange::modified(entity_id, snapshot.clone()),
                    (true, false) => DocumentChange::removed(entity_id),
                    (false, false) => return None,
                };
                Some((Arc::clone(&s.sink), change))
            })
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MemoryStore {
    fn subscribe(
        &self,
        collection_id: CollectionId,
        filter: &Filter,
        sink: ChangeSink,
    ) -> StoreResult<QueryId> {
        self.check_online()?;
        if self.denied_collections.lock().contains(&collection_id) {
            return Err(StoreError::PermissionDenied(format!(
                "subscribe denied for {collection_id}"
            )));
        }

        let query_id = QueryId(self.next_query_id.fetch_add(1, Ordering::SeqCst));
        self.subs.lock().insert(
            query_id,
            SubEntry {
                collection_id,
                filter: filter.clone(),
                sink: Arc::clone(&sink),
            },
        );

        // Initial matching set, delivered as added records.
        let initial: Vec<DocumentChange> = {
            let docs = self.docs.lock();
            docs.iter()
                .filter(|((c, _), snap)| *c == collection_id && filter.matches(snap))
                .map(|((_, e), snap)| DocumentChange::added(*e, snap.clone()))
                .collect()
        };
        if !initial.is_empty() {
            sink(initial);
        }

        Ok(query_id)
    }

    fn unsubscribe(&self, query_id: QueryId) {
        self.subs.lock().remove(&query_id);
    }

    fn read(&self, collection_id: CollectionId, entity_id: EntityId) -> StoreResult<Snapshot> {
        self.check_online()?;
        self.docs
            .lock()
            .get(&(collection_id, entity_id))
            .cloned()
            .ok_or(StoreError::NotFound {
                collection_id,
                entity_id,
            })
    }

    fn write(
        &self,
        collection_id: CollectionId,
        entity_id: EntityId,
        kind: OperationKind,
        patch: &FieldMap,
    ) -> StoreResult<WriteReceipt> {
        self.check_online()?;
        if let Some(err) = self.write_rejections.lock().get(&entity_id) {
            return Err(err.clone());
        }

        let stamp = self.stamp();
        let notifications = {
            let mut docs = self.docs.lock();
            let key = (collection_id, entity_id);
            match kind {
                OperationKind::Create | OperationKind::Update => {
                    let existed = docs.contains_key(&key);
                    let mut snapshot = docs.get(&key).cloned().unwrap_or_else(Snapshot::empty);
                    snapshot.apply_patch(patch);
                    let snapshot = snapshot.with_timestamp(stamp);
                    docs.insert(key, snapshot.clone());
                    self.matching_sinks(collection_id, entity_id, &snapshot, existed)
                }
                OperationKind::Delete => {
                    if docs.remove(&key).is_none() {
                        return Err(StoreError::NotFound {
                            collection_id,
                            entity_id,
                        });
                    }
                    let subs = self.subs.lock();
                    subs.values()
                        .filter(|s| s.collection_id == collection_id)
                        .map(|s| (Arc::clone(&s.sink), DocumentChange::removed(entity_id)))
                        .collect()
                }
            }
        };

        self.write_log.lock().push(WriteOp {
            collection_id,
            entity_id,
            kind,
            patch: patch.clone(),
        });

        for (sink, change) in notifications {
            sink(vec![change]);
        }

        Ok(WriteReceipt {
            server_timestamp_ms: stamp,
        })
    }

    fn batch_write(&self, ops: &[WriteOp]) -> StoreResult<Vec<StoreResult<WriteReceipt>>> {
        self.check_online()?;
        if !self.batch_supported.load(Ordering::SeqCst) {
            return Err(StoreError::BatchUnsupported);
        }

        Ok(ops
            .iter()
            .map(|op| self.write(op.collection_id, op.entity_id, op.kind, &op.patch))
            .collect())
    }
}

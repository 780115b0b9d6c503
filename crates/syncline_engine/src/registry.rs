//! Subscription registry: shared live queries with fan-out.
//!
//! Identical queries are shared: the first subscriber opens one underlying
//! live query, later subscribers attach to it, and the last one to leave
//! closes it. Query identity is the (collection, filter) pair.

use crate::error::{EngineError, EngineResult};
use crate::store::{ChangeSink, Filter, QueryId, RemoteStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use syncline_model::{ChangeSet, CollectionId, DocumentChange};
use tracing::{debug, warn};

/// Unsubscribe token for one view's attachment to a shared query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// Receives classified deltas for one view.
pub type ViewCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Receives the permanent error that killed a view's shared query.
///
/// A live query can be rejected after subscription time: a reopen on
/// reconnect runs with no caller to hand the error to, so it is pushed
/// here instead. Fired at most once per subscriber.
pub type ErrorCallback = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// Receives raw pushes tagged with their query key.
///
/// The engine installs a hook that feeds the debounce scheduler; the
/// registry itself never interprets pushes.
pub type DeliverHook = Arc<dyn Fn(String, Vec<DocumentChange>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    /// Wanted but not open; reopened on the next reconnect.
    Pending,
    /// Open against the store.
    Active,
    /// Rejected permanently; never retried.
    Errored,
}

struct Subscriber {
    id: u64,
    on_change: ViewCallback,
    on_error: Option<ErrorCallback>,
}

struct SharedQuery {
    collection_id: CollectionId,
    filter: Filter,
    query_id: Option<QueryId>,
    state: QueryState,
    subscribers: Vec<Subscriber>,
}

/// Tracks live queries and the views attached to them.
pub struct SubscriptionRegistry {
    store: Arc<dyn RemoteStore>,
    deliver: DeliverHook,
    queries: Mutex<HashMap<String, SharedQuery>>,
    handles: Mutex<HashMap<u64, String>>,
    next_handle: AtomicU64,
}

impl SubscriptionRegistry {
    /// Creates a registry delivering raw pushes through `deliver`.
    pub fn new(store: Arc<dyn RemoteStore>, deliver: DeliverHook) -> Self {
        Self {
            store,
            deliver,
            queries: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// The canonical key for a (collection, filter) pair.
    pub fn query_key(collection_id: CollectionId, filter: &Filter) -> String {
        format!("{}|{}", collection_id.0, filter.key())
    }

    /// Attaches a view to the shared query for (collection, filter),
    /// opening the underlying live query if this is the first subscriber.
    ///
    /// A permanent rejection (permissions, bad filter) is returned once,
    /// here. A connectivity failure is not an error: the query stays wanted
    /// and opens on the next reconnect.
    pub fn subscribe(
        &self,
        collection_id: CollectionId,
        filter: Filter,
        callback: ViewCallback,
    ) -> EngineResult<SubscriptionHandle> {
        self.attach(collection_id, filter, callback, None)
    }

    /// Like [`SubscriptionRegistry::subscribe`], with an error callback
    /// that reports a later permanent rejection of the shared query (a
    /// reopen on reconnect failing because access was revoked).
    pub fn subscribe_with_errors(
        &self,
        collection_id: CollectionId,
        filter: Filter,
        callback: ViewCallback,
        on_error: ErrorCallback,
    ) -> EngineResult<SubscriptionHandle> {
        self.attach(collection_id, filter, callback, Some(on_error))
    }

    fn attach(
        &self,
        collection_id: CollectionId,
        filter: Filter,
        callback: ViewCallback,
        on_error: Option<ErrorCallback>,
    ) -> EngineResult<SubscriptionHandle> {
        let key = Self::query_key(collection_id, &filter);
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let subscriber = Subscriber {
            id: handle,
            on_change: callback,
            on_error,
        };

        let needs_open = {
            let mut queries = self.queries.lock();
            match queries.get_mut(&key) {
                Some(query) => {
                    if query.state == QueryState::Errored {
                        return Err(EngineError::Permission(format!(
                            "query {key} was rejected by the store"
                        )));
                    }
                    query.subscribers.push(subscriber);
                    false
                }
                None => {
                    queries.insert(
                        key.clone(),
                        SharedQuery {
                            collection_id,
                            filter,
                            query_id: None,
                            state: QueryState::Pending,
                            subscribers: vec![subscriber],
                        },
                    );
                    true
                }
            }
        };

        if needs_open {
            if let Err(err) = self.open(&key) {
                // Permanent rejection: drop the query and report it to the
                // one caller that triggered the open.
                self.queries.lock().remove(&key);
                return Err(err);
            }
        }

        self.handles.lock().insert(handle, key);
        Ok(SubscriptionHandle(handle))
    }

    /// Detaches a view. The underlying query closes when the last view
    /// leaves. Unknown handles are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let Some(key) = self.handles.lock().remove(&handle.0) else {
            return;
        };

        let close = {
            let mut queries = self.queries.lock();
            let Some(query) = queries.get_mut(&key) else {
                return;
            };
            query.subscribers.retain(|s| s.id != handle.0);
            if query.subscribers.is_empty() {
                let query_id = query.query_id.take();
                queries.remove(&key);
                Some(query_id)
            } else {
                None
            }
        };

        if let Some(query_id) = close {
            debug!(%key, "closing shared query, last subscriber left");
            if let Some(query_id) = query_id {
                self.store.unsubscribe(query_id);
            }
        }
    }

    /// Fans a classified delta out to every view attached to `key`.
    pub fn dispatch(&self, key: &str, set: &ChangeSet) {
        let callbacks: Vec<ViewCallback> = {
            let queries = self.queries.lock();
            match queries.get(key) {
                Some(query) => query
                    .subscribers
                    .iter()
                    .map(|s| Arc::clone(&s.on_change))
                    .collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(set);
        }
    }

    /// The collection a query key belongs to.
    pub fn query_collection(&self, key: &str) -> Option<CollectionId> {
        self.queries.lock().get(key).map(|q| q.collection_id)
    }

    /// Tears down and reopens every wanted query.
    ///
    /// Called on reconnect: live queries do not survive a connection loss,
    /// so each one is closed (dropping any stale server-side cursor) and
    /// opened fresh. The fresh open replays the initial matching set, which
    /// reconciles anything missed while offline. Queries rejected
    /// permanently before are not retried.
    pub fn reopen_all(&self) {
        let keys: Vec<String> = {
            let queries = self.queries.lock();
            queries
                .iter()
                .filter(|(_, q)| q.state != QueryState::Errored)
                .map(|(k, _)| k.clone())
                .collect()
        };

        for key in keys {
            let stale = {
                let mut queries = self.queries.lock();
                match queries.get_mut(&key) {
                    Some(query) => {
                        query.state = QueryState::Pending;
                        query.query_id.take()
                    }
                    None => continue,
                }
            };
            if let Some(query_id) = stale {
                self.store.unsubscribe(query_id);
            }
            if let Err(err) = self.open(&key) {
                warn!(%key, %err, "query rejected on reopen");
                let callbacks: Vec<ErrorCallback> = {
                    let mut queries = self.queries.lock();
                    match queries.get_mut(&key) {
                        Some(query) => {
                            query.state = QueryState::Errored;
                            query
                                .subscribers
                                .iter()
                                .filter_map(|s| s.on_error.clone())
                                .collect()
                        }
                        None => Vec::new(),
                    }
                };
                // Errored queries are skipped on later reopens, so each
                // subscriber hears about the rejection once.
                for callback in callbacks {
                    callback(&err);
                }
            }
        }
    }

    /// Closes every query without forgetting the handles. Used at engine
    /// shutdown.
    pub fn close_all(&self) {
        let stale: Vec<QueryId> = {
            let mut queries = self.queries.lock();
            queries
                .values_mut()
                .filter_map(|query| {
                    query.state = QueryState::Pending;
                    query.query_id.take()
                })
                .collect()
        };
        for query_id in stale {
            self.store.unsubscribe(query_id);
        }
    }

    /// Number of shared queries currently wanted.
    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    /// Opens the underlying live query for `key`.
    ///
    /// Returns `Ok` both on success and on a connectivity failure (the
    /// query stays pending); only permanent rejections surface as errors.
    fn open(&self, key: &str) -> EngineResult<()> {
        let (collection_id, filter) = {
            let queries = self.queries.lock();
            let Some(query) = queries.get(key) else {
                return Ok(());
            };
            (query.collection_id, query.filter.clone())
        };

        let sink: ChangeSink = {
            let deliver = Arc::clone(&self.deliver);
            let key = key.to_string();
            Arc::new(move |changes| deliver(key.clone(), changes))
        };

        // The store calls the sink synchronously with the initial matching
        // set, so no registry lock may be held here.
        match self.store.subscribe(collection_id, &filter, sink) {
            Ok(query_id) => {
                let mut queries = self.queries.lock();
                if let Some(query) = queries.get_mut(key) {
                    query.query_id = Some(query_id);
                    query.state = QueryState::Active;
                }
                Ok(())
            }
            Err(err) if err.is_connectivity() => {
                debug!(%key, "store unreachable, query stays pending");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex as PMutex;
    use serde_json::json;
    use syncline_model::{EntityId, FieldMap, OperationKind};

    const COLLECTION: CollectionId = CollectionId(1);

    fn noop_view() -> ViewCallback {
        Arc::new(|_: &ChangeSet| {})
    }

    fn counting_hook() -> (DeliverHook, Arc<PMutex<Vec<String>>>) {
        let seen: Arc<PMutex<Vec<String>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: DeliverHook = Arc::new(move |key, _changes| sink.lock().push(key));
        (hook, seen)
    }

    fn fields(quality: i64) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("quality".to_string(), json!(quality));
        map
    }

    #[test]
    fn identical_queries_share_one_underlying_query() {
        let store = Arc::new(MemoryStore::new());
        let (hook, seen) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();
        registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();
        assert_eq!(registry.query_count(), 1);

        seen.lock().clear();
        store.upsert_remote(COLLECTION, EntityId(1), fields(5), 2_000);

        // One push reaches the hook once, not once per subscriber.
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn dispatch_fans_out_to_all_subscribers() {
        let store = Arc::new(MemoryStore::new());
        let (hook, _) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        let hits: Arc<PMutex<Vec<u8>>> = Arc::new(PMutex::new(Vec::new()));
        let a = Arc::clone(&hits);
        let b = Arc::clone(&hits);
        registry
            .subscribe(COLLECTION, Filter::All, Arc::new(move |_| a.lock().push(1)))
            .unwrap();
        registry
            .subscribe(COLLECTION, Filter::All, Arc::new(move |_| b.lock().push(2)))
            .unwrap();

        let key = SubscriptionRegistry::query_key(COLLECTION, &Filter::All);
        registry.dispatch(&key, &ChangeSet::default());

        assert_eq!(*hits.lock(), vec![1, 2]);
    }

    #[test]
    fn last_unsubscribe_closes_the_query() {
        let store = Arc::new(MemoryStore::new());
        let (hook, seen) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        let first = registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();
        let second = registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();

        registry.unsubscribe(first);
        assert_eq!(registry.query_count(), 1);

        registry.unsubscribe(second);
        assert_eq!(registry.query_count(), 0);

        seen.lock().clear();
        store.upsert_remote(COLLECTION, EntityId(1), fields(5), 2_000);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn offline_subscribe_stays_pending_and_reopens() {
        let store = Arc::new(MemoryStore::new());
        let (hook, seen) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        store.set_offline(true);
        registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();
        assert_eq!(registry.query_count(), 1);
        assert!(seen.lock().is_empty());

        store.set_offline(false);
        store.upsert_remote(COLLECTION, EntityId(1), fields(5), 2_000);
        registry.reopen_all();

        // The fresh open replays the matching set missed while offline.
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn permission_rejection_surfaces_once_at_subscribe() {
        let store = Arc::new(MemoryStore::new());
        store.deny_collection(COLLECTION);
        let (hook, _) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        let err = registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(registry.query_count(), 0);
    }

    #[test]
    fn reopen_replaces_the_stale_query_id() {
        let store = Arc::new(MemoryStore::new());
        let (hook, seen) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();
        registry.reopen_all();

        seen.lock().clear();
        store.upsert_remote(COLLECTION, EntityId(1), fields(5), 2_000);
        // Exactly one live query delivers; the stale one was torn down.
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn reopen_rejection_reaches_the_error_callback_once() {
        let store = Arc::new(MemoryStore::new());
        let (hook, _) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        let errors: Arc<PMutex<Vec<EngineError>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        store.set_offline(true);
        registry
            .subscribe_with_errors(
                COLLECTION,
                Filter::All,
                noop_view(),
                Arc::new(move |err: &EngineError| sink.lock().push(err.clone())),
            )
            .unwrap();
        assert!(errors.lock().is_empty());

        // Access was revoked while the client was away.
        store.set_offline(false);
        store.deny_collection(COLLECTION);
        registry.reopen_all();

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].is_permanent());

        // Errored queries are never retried, so the report never repeats.
        registry.reopen_all();
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn filtered_queries_are_distinct() {
        let store = Arc::new(MemoryStore::new());
        let (hook, _) = counting_hook();
        let registry =
            SubscriptionRegistry::new(Arc::clone(&store) as Arc<dyn RemoteStore>, hook);

        registry
            .subscribe(COLLECTION, Filter::All, noop_view())
            .unwrap();
        registry
            .subscribe(
                COLLECTION,
                Filter::FieldEquals {
                    field: "deck".to_string(),
                    value: json!("spanish"),
                },
                noop_view(),
            )
            .unwrap();

        assert_eq!(registry.query_count(), 2);
    }
}

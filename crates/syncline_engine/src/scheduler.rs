//! Update scheduling: debounced dispatch and batched commits.
//!
//! Without debouncing, every incoming push would trigger a full downstream
//! recomputation; a burst of five review updates inside one second means
//! five redundant rebuilds. The scheduler collapses each burst into one
//! trailing dispatch carrying everything accumulated since the first
//! trigger.

use crate::store::{RemoteStore, StoreError, StoreResult, WriteOp, WriteReceipt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

struct DebounceEntry<T> {
    deadline_ms: u64,
    items: Vec<T>,
}

/// Keyed trailing-edge debouncer.
///
/// Each trigger under a key extends that key's deadline by the window and
/// appends to its accumulated state; the key fires once the deadline passes
/// with no further triggers. Time is passed in by the engine's tick: the
/// scheduler never sleeps.
pub struct UpdateScheduler<T> {
    entries: Mutex<HashMap<String, DebounceEntry<T>>>,
}

impl<T> UpdateScheduler<T> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a trigger under `key`, accumulating `items`.
    pub fn debounce(
        &self,
        key: impl Into<String>,
        items: impl IntoIterator<Item = T>,
        window: Duration,
        now_ms: u64,
    ) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.into()).or_insert_with(|| DebounceEntry {
            deadline_ms: 0,
            items: Vec::new(),
        });
        entry.deadline_ms = now_ms + window.as_millis() as u64;
        entry.items.extend(items);
    }

    /// Harvests every key whose window has elapsed.
    pub fn take_due(&self, now_ms: u64) -> Vec<(String, Vec<T>)> {
        let mut entries = self.entries.lock();
        let due_keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.deadline_ms <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();

        let mut due: Vec<(String, Vec<T>)> = due_keys
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|e| (key, e.items)))
            .collect();
        due.sort_by(|(a, _), (b, _)| a.cmp(b));
        due
    }

    /// Number of keys with pending, unfired state.
    pub fn pending_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<T> Default for UpdateScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Submits independent mutations as one unit.
///
/// Prefers the store's atomic multi-write; when the store reports
/// [`StoreError::BatchUnsupported`] the operations are submitted
/// sequentially instead, and failures are reported per operation rather
/// than aborting the rest of the batch.
pub fn batch_commit(
    store: &dyn RemoteStore,
    ops: &[WriteOp],
) -> Vec<StoreResult<WriteReceipt>> {
    match store.batch_write(ops) {
        Ok(results) => results,
        Err(StoreError::BatchUnsupported) => ops
            .iter()
            .map(|op| store.write(op.collection_id, op.entity_id, op.kind, &op.patch))
            .collect(),
        Err(err) => ops.iter().map(|_| Err(err.clone())).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use syncline_model::{CollectionId, EntityId, FieldMap, OperationKind};

    const WINDOW: Duration = Duration::from_millis(75);

    #[test]
    fn n_triggers_one_trailing_dispatch() {
        let scheduler: UpdateScheduler<u32> = UpdateScheduler::new();

        scheduler.debounce("cards", [1], WINDOW, 0);
        scheduler.debounce("cards", [2], WINDOW, 10);
        scheduler.debounce("cards", [3], WINDOW, 20);

        // Still inside the window measured from the last trigger.
        assert!(scheduler.take_due(90).is_empty());

        let due = scheduler.take_due(95);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "cards");
        assert_eq!(due[0].1, vec![1, 2, 3]);

        // Harvesting is consuming.
        assert!(scheduler.take_due(1_000).is_empty());
    }

    #[test]
    fn keys_fire_independently() {
        let scheduler: UpdateScheduler<u32> = UpdateScheduler::new();

        scheduler.debounce("a", [1], WINDOW, 0);
        scheduler.debounce("b", [2], WINDOW, 50);

        let due = scheduler.take_due(80);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "a");

        let due = scheduler.take_due(130);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "b");
    }

    #[test]
    fn batch_commit_uses_atomic_path() {
        let store = MemoryStore::new();
        let ops = vec![
            WriteOp {
                collection_id: CollectionId(1),
                entity_id: EntityId(1),
                kind: OperationKind::Create,
                patch: FieldMap::new(),
            },
            WriteOp {
                collection_id: CollectionId(1),
                entity_id: EntityId(2),
                kind: OperationKind::Create,
                patch: FieldMap::new(),
            },
        ];

        let results = batch_commit(&store, &ops);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn batch_commit_falls_back_sequentially() {
        let store = MemoryStore::new();
        store.set_batch_supported(false);
        store.reject_writes(EntityId(2), StoreError::InvalidPayload("bad".into()));

        let ops = vec![
            WriteOp {
                collection_id: CollectionId(1),
                entity_id: EntityId(1),
                kind: OperationKind::Create,
                patch: FieldMap::new(),
            },
            WriteOp {
                collection_id: CollectionId(1),
                entity_id: EntityId(2),
                kind: OperationKind::Create,
                patch: FieldMap::new(),
            },
            WriteOp {
                collection_id: CollectionId(1),
                entity_id: EntityId(3),
                kind: OperationKind::Create,
                patch: FieldMap::new(),
            },
        ];

        let results = batch_commit(&store, &ops);
        assert_eq!(results.len(), 3);
        // One failure does not abort the rest.
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StoreError::InvalidPayload(_))));
        assert!(results[2].is_ok());
    }
}

//! Durable offline mutation queue.

use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use syncline_model::{CoalesceResult, EntityId, PendingOperation};
use tracing::{debug, warn};

/// Persistence backend for the queue journal.
///
/// The journal is single-writer: only the owning [`OfflineQueue`] mutates
/// it. `save` must be atomic: a crash mid-save leaves either the old or
/// the new journal, never a torn one.
pub trait QueueStore: Send + Sync {
    /// Loads the persisted operations, oldest first.
    fn load(&self) -> EngineResult<Vec<PendingOperation>>;

    /// Replaces the journal with the given operations.
    fn save(&self, ops: &[PendingOperation]) -> EngineResult<()>;
}

/// In-memory journal for tests.
#[derive(Default)]
pub struct MemoryQueueStore {
    ops: Mutex<Vec<PendingOperation>>,
}

impl MemoryQueueStore {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the persisted operations.
    pub fn persisted(&self) -> Vec<PendingOperation> {
        self.ops.lock().clone()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> EngineResult<Vec<PendingOperation>> {
        Ok(self.ops.lock().clone())
    }

    fn save(&self, ops: &[PendingOperation]) -> EngineResult<()> {
        *self.ops.lock() = ops.to_vec();
        Ok(())
    }
}

/// CBOR journal on disk, written with temp-file-plus-rename so a crash
/// mid-save cannot tear it.
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    /// Creates a store journaling at the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the journal path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn persistence(err: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence(err.to_string())
}

impl QueueStore for FileQueueStore {
    fn load(&self) -> EngineResult<Vec<PendingOperation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(persistence)?;
        ciborium::de::from_reader(BufReader::new(file)).map_err(persistence)
    }

    fn save(&self, ops: &[PendingOperation]) -> EngineResult<()> {
        let tmp = self.path.with_extension("journal.tmp");
        {
            let file = File::create(&tmp).map_err(persistence)?;
            let mut writer = BufWriter::new(file);
            ciborium::ser::into_writer(&ops.to_vec(), &mut writer).map_err(persistence)?;
            writer.flush().map_err(persistence)?;
            writer
                .into_inner()
                .map_err(persistence)?
                .sync_all()
                .map_err(persistence)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(persistence)
    }
}

/// Outcome of one [`OfflineQueue::drain`].
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Operation ids confirmed and removed from the queue.
    pub succeeded: Vec<u64>,
    /// Transient failures: (id, error). The operation stays queued with the
    /// error attached and will be retried on the next drain.
    pub failed: Vec<(u64, EngineError)>,
    /// Permanent failures: (id, error). The operation was dropped from the
    /// queue and the error is user-visible.
    pub dropped: Vec<(u64, EngineError)>,
}

impl DrainReport {
    /// Returns true if every operation was replayed successfully.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.dropped.is_empty()
    }
}

/// How [`OfflineQueue::enqueue`] disposed of an operation.
///
/// Anything other than `Queued` means the operation will never replay under
/// its own id; the caller must settle whatever tracks that id against the
/// id reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as its own queue entry.
    Queued,
    /// Folded into the queued operation with the given id, which now
    /// carries the combined effect.
    MergedInto(u64),
    /// A queued create (the given id) was cancelled by this delete. Neither
    /// operation reaches the store; their net effect is nothing.
    CancelledWith(u64),
}

struct QueueInner {
    ops: Vec<PendingOperation>,
    in_flight: HashSet<u64>,
}

/// Durable, per-entity FIFO store of mutations awaiting replay.
///
/// Operations against one entity apply strictly in enqueue order; across
/// entities no order is guaranteed. A later mutation to an entity whose
/// earlier mutation is still queued (not in flight) coalesces into it per
/// the model's folding rules. At most one operation per entity is ever in
/// flight.
pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    inner: Mutex<QueueInner>,
}

impl OfflineQueue {
    /// Opens the queue, loading any journal that survived a restart.
    pub fn open(store: Arc<dyn QueueStore>) -> EngineResult<Self> {
        let ops = store.load()?;
        Ok(Self {
            store,
            inner: Mutex::new(QueueInner {
                ops,
                in_flight: HashSet::new(),
            }),
        })
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ops.is_empty()
    }

    /// Snapshot of the queued operations, oldest first.
    pub fn operations(&self) -> Vec<PendingOperation> {
        self.inner.lock().ops.clone()
    }

    /// Number of queued operations for one entity.
    pub fn pending_for(&self, entity_id: EntityId) -> usize {
        self.inner
            .lock()
            .ops
            .iter()
            .filter(|op| op.entity_id == entity_id)
            .count()
    }

    /// Enqueues a mutation, coalescing with the entity's queued tail.
    ///
    /// The returned outcome says whether the operation kept its own queue
    /// entry or was absorbed by an earlier one.
    pub fn enqueue(&self, op: PendingOperation) -> EngineResult<EnqueueOutcome> {
        let outcome = {
            let mut inner = self.inner.lock();
            let tail = inner
                .ops
                .iter()
                .rposition(|queued| queued.entity_id == op.entity_id);

            match tail {
                Some(index) if !inner.in_flight.contains(&inner.ops[index].id) => {
                    let absorber = inner.ops[index].id;
                    match inner.ops[index].coalesce(op) {
                        CoalesceResult::Merged => EnqueueOutcome::MergedInto(absorber),
                        CoalesceResult::Cancelled => {
                            inner.ops.remove(index);
                            EnqueueOutcome::CancelledWith(absorber)
                        }
                        CoalesceResult::Chain(later) => {
                            inner.ops.push(later);
                            EnqueueOutcome::Queued
                        }
                    }
                }
                _ => {
                    inner.ops.push(op);
                    EnqueueOutcome::Queued
                }
            }
        };
        self.persist()?;
        Ok(outcome)
    }

    /// Replays every queued operation through the executor, in waves.
    ///
    /// Called automatically on the offline→online transition. A wave is the
    /// oldest runnable operation of every entity; entities are independent,
    /// so the executor receives the whole wave at once and may submit it as
    /// a batch. It must return one result per operation, in order.
    ///
    /// Per entity, operations run in enqueue order; a transient failure
    /// parks the entity for the rest of this drain (its remaining
    /// operations stay queued, in order). Transient failures are retried
    /// within the drain per the injected [`RetryPolicy`]; permanent
    /// failures are dropped and reported rather than retried forever.
    pub fn drain(
        &self,
        executor: &mut dyn FnMut(&[PendingOperation]) -> Vec<EngineResult<()>>,
        retry: &RetryPolicy,
    ) -> EngineResult<DrainReport> {
        let mut report = DrainReport::default();
        let mut parked: HashSet<EntityId> = HashSet::new();

        loop {
            // Assemble the wave without holding the lock across the
            // executor call.
            let wave = {
                let mut inner = self.inner.lock();
                let mut claimed: HashSet<EntityId> = HashSet::new();
                let wave: Vec<PendingOperation> = inner
                    .ops
                    .iter()
                    .filter(|op| {
                        !parked.contains(&op.entity_id) && claimed.insert(op.entity_id)
                    })
                    .cloned()
                    .collect();
                for op in &wave {
                    inner.in_flight.insert(op.id);
                }
                wave
            };
            if wave.is_empty() {
                break;
            }

            let mut pending = wave;
            let mut succeeded: Vec<u64> = Vec::new();
            let mut dropped: Vec<(u64, EngineError)> = Vec::new();
            let mut transient: Vec<(PendingOperation, EngineError)>;
            let mut attempt = 0;
            loop {
                if attempt > 0 {
                    std::thread::sleep(retry.delay_for_attempt(attempt));
                }
                let results = executor(&pending);
                transient = Vec::new();
                for (op, result) in pending.iter().zip(results) {
                    match result {
                        Ok(()) => succeeded.push(op.id),
                        Err(err) if err.is_transient() => transient.push((op.clone(), err)),
                        Err(err) => dropped.push((op.id, err)),
                    }
                }
                attempt += 1;
                if transient.is_empty() || attempt >= retry.max_attempts {
                    break;
                }
                pending = transient.iter().map(|(op, _)| op.clone()).collect();
            }

            {
                let mut inner = self.inner.lock();
                for id in &succeeded {
                    inner.in_flight.remove(id);
                    inner.ops.retain(|queued| queued.id != *id);
                }
                for (id, err) in &dropped {
                    warn!(op_id = *id, %err, "replay rejected permanently, dropping");
                    inner.in_flight.remove(id);
                    inner.ops.retain(|queued| queued.id != *id);
                }
                for (op, err) in &transient {
                    debug!(op_id = op.id, %err, "replay failed, keeping queued");
                    inner.in_flight.remove(&op.id);
                    if let Some(queued) = inner.ops.iter_mut().find(|q| q.id == op.id) {
                        queued.last_error = Some(err.to_string());
                    }
                    parked.insert(op.entity_id);
                }
            }
            report.succeeded.extend(succeeded);
            report.dropped.extend(dropped);
            for (op, err) in transient {
                report.failed.push((op.id, err));
            }
        }

        self.persist()?;
        Ok(report)
    }

    fn persist(&self) -> EngineResult<()> {
        let ops = self.inner.lock().ops.clone();
        self.store.save(&ops)
    }
}

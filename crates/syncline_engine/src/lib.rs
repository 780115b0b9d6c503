//! # Syncline Engine
//!
//! Client-side synchronization engine for a document-oriented remote
//! backend. Keeps local views consistent with remote state while absorbing
//! connectivity loss: mutations apply optimistically, queue while offline,
//! and replay on reconnect; divergence resolves by last-writer-wins on
//! server timestamps.
//!
//! The engine is deterministic and tick-driven. Hosts inject a [`Clock`]
//! and call [`SyncEngine::tick`] from their event loop; probes, debounce
//! windows and confirmation deadlines all advance from that clock, which
//! makes every time-based behavior testable with a [`ManualClock`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncline_engine::{
//!     Clock, EngineConfig, Filter, MemoryQueueStore, MemoryStore, RemoteStore, SyncEngine,
//!     SystemClock,
//! };
//! use syncline_model::CollectionId;
//!
//! # fn main() -> Result<(), syncline_engine::EngineError> {
//! let engine = SyncEngine::new(
//!     EngineConfig::new(),
//!     Arc::new(MemoryStore::new()) as Arc<dyn RemoteStore>,
//!     Arc::new(SystemClock) as Arc<dyn Clock>,
//!     Arc::new(MemoryQueueStore::new()),
//! )?;
//! engine.start();
//! let handle = engine.register_view(
//!     CollectionId(1),
//!     Filter::All,
//!     Arc::new(|delta| println!("{} changes", delta.len())),
//! )?;
//! engine.tick();
//! engine.unregister_view(handle);
//! engine.stop();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod clock;
mod config;
mod connection;
mod engine;
mod error;
mod queue;
mod registry;
mod resolver;
mod scheduler;
mod store;

pub use changes::ChangeProcessor;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RetryPolicy};
pub use connection::{ConnectionMonitor, ConnectionState, ListenerToken};
pub use engine::SyncEngine;
pub use error::{EngineError, EngineResult};
pub use queue::{
    DrainReport, EnqueueOutcome, FileQueueStore, MemoryQueueStore, OfflineQueue, QueueStore,
};
pub use registry::{
    DeliverHook, ErrorCallback, SubscriptionHandle, SubscriptionRegistry, ViewCallback,
};
pub use resolver::{ConflictResolver, MutationOutcome, MutationState, MutationTicket};
pub use scheduler::{batch_commit, UpdateScheduler};
pub use store::{
    ChangeSink, Filter, MemoryStore, QueryId, RemoteStore, StoreError, StoreResult, WriteOp,
    WriteReceipt,
};

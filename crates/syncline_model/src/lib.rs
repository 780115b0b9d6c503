//! # Syncline Model
//!
//! Data model shared by the Syncline client synchronization engine.
//!
//! This crate provides:
//! - Entity snapshots (document field maps with server-assigned timestamps)
//! - Raw change deltas and classified change sets
//! - Pending operations with per-entity coalescing rules
//! - Conflict records and resolution (last-writer-wins, field-level merge)
//!
//! Everything here is pure data: no I/O, no clocks, no side effects. The
//! engine crate owns all time- and network-driven behavior.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod delta;
mod ids;
mod operation;
mod snapshot;

pub use conflict::{ConflictOutcome, ConflictRecord, ResolutionStrategy};
pub use delta::{ChangeKind, ChangeSet, DocumentChange};
pub use ids::{CollectionId, EntityId};
pub use operation::{CoalesceResult, OperationKind, PendingOperation};
pub use snapshot::{FieldMap, Snapshot};

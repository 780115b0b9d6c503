//! Error types for the sync engine.

use syncline_model::EntityId;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the sync engine.
///
/// The taxonomy drives retry behavior: transient errors are absorbed by the
/// engine and replayed on reconnect without caller involvement, permanent
/// errors are dropped from the queue and surfaced to the caller, timeouts
/// are treated as optimistic success and only logged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The remote store is unreachable. Transient; retried via queue drain.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The server rejected the caller's access. Permanent; never retried.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The server rejected the payload. Permanent; never retried.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// A divergence could not be resolved automatically.
    #[error("unresolved conflict for {entity_id}")]
    Conflict {
        /// The entity in conflict.
        entity_id: EntityId,
    },

    /// A confirmation did not arrive within the bounded wait.
    #[error("confirmation timed out")]
    Timeout,

    /// The durable queue journal could not be read or written.
    #[error("queue persistence error: {0}")]
    Persistence(String),

    /// The engine is not running.
    #[error("engine is stopped")]
    Stopped,

    /// No mutation is tracked under the given ticket.
    #[error("unknown mutation ticket {0}")]
    UnknownTicket(u64),
}

impl EngineError {
    /// Returns true if the engine will retry this error automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Connectivity(_) | EngineError::Timeout)
    }

    /// Returns true if retrying is futile and the caller must be told.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            EngineError::Permission(_) | EngineError::Validation(_)
        )
    }
}

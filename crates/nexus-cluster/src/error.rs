use nexus_broker::BrokerError;
use thiserror::Error;

/// Errors surfaced by the clustering core.
///
/// Per spec.md §7, none of these ever panic or propagate out of a
/// background loop — they are logged and counted at the loop boundary.
/// This enum exists for operations that return a `Result` to a caller
/// synchronously (e.g. `MemoryIndex::store` rejecting a dimension
/// mismatch), not for the degrade-and-continue paths inside loops.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("this agent is not the primary")]
    NotLeader,

    #[error("an election is already in progress")]
    ElectionInProgress,

    #[error("could not acquire the election lock")]
    LockNotAcquired,

    #[error("no handler registered for task type {0:?}")]
    UnknownTaskType(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

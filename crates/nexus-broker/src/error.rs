use thiserror::Error;

/// Errors surfaced by the broker layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection could not be established or was lost.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A command exceeded its deadline.
    #[error("broker operation timed out")]
    Timeout,

    /// The broker rejected or failed to execute a command.
    #[error("broker command failed: {0}")]
    Command(String),

    /// An optional broker module (e.g. vector search) is not loaded.
    #[error("broker module unavailable: {0}")]
    Unavailable(&'static str),
}

/// A specialized `Result` for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

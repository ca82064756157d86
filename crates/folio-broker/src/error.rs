use thiserror::Error;

/// Broker operation errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker descriptor: {0}")]
    Descriptor(String),

    #[error("Broker '{0}' is not running")]
    NotRunning(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Errors a consumer loop should ride out with a backoff rather than exit on.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::NotRunning(_) | BrokerError::Io(_))
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

//! Error types module
//!
//! All failures of the task queue are described by [`QueueError`]. Only
//! `QueueUnavailable` and `Connectivity` are ever returned to code that submits
//! tasks; every other variant is resolved inside the consume loop and only logged.
//!
//! The `From<sqlx::Error>` conversion is gated behind the `sqlx` feature.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for conditions the caller already sees as a return value
    Debug,
    /// Warning level - for per-message failures that the broker will route on
    Warn,
    /// Error level - for failures that need operator attention
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Broker connectivity error: {0}")]
    Connectivity(String),

    #[error("Task queue is not running")]
    QueueUnavailable,

    #[error("No handler registered for task '{0}'")]
    HandlerNotFound(String),

    #[error("Handler for task '{task_name}' failed: {message}")]
    HandlerFailure { task_name: String, message: String },

    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Malformed message payload: {0}")]
    MalformedPayload(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn persistence(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        QueueError::Persistence {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Machine-readable error code (e.g. "QUEUE_UNAVAILABLE")
    pub fn error_code(&self) -> &'static str {
        match self {
            QueueError::Configuration(_) => "CONFIGURATION_ERROR",
            QueueError::Connectivity(_) => "CONNECTIVITY_ERROR",
            QueueError::QueueUnavailable => "QUEUE_UNAVAILABLE",
            QueueError::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            QueueError::HandlerFailure { .. } => "HANDLER_FAILURE",
            QueueError::Persistence { .. } => "PERSISTENCE_ERROR",
            QueueError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
        }
    }

    /// Whether the caller of `submit()` may reasonably try again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QueueError::Connectivity(_) | QueueError::QueueUnavailable
        )
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            QueueError::QueueUnavailable => LogLevel::Debug,
            QueueError::HandlerNotFound(_)
            | QueueError::HandlerFailure { .. }
            | QueueError::MalformedPayload(_) => LogLevel::Warn,
            QueueError::Configuration(_)
            | QueueError::Connectivity(_)
            | QueueError::Persistence { .. } => LogLevel::Error,
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for QueueError {
    fn from(err: SqlxError) -> Self {
        QueueError::Persistence {
            message: err.to_string(),
            source: err.into(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::MalformedPayload(err.to_string())
    }
}

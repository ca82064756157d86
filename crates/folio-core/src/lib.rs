//! Folio Core Library
//!
//! This crate provides the domain models, error types and configuration shared by
//! the task queue components: the message envelope, task status, and the queue
//! configuration loaded from the environment.

pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::QueueConfig;
pub use error::{LogLevel, QueueError, QueueResult};
pub use models::{MessageEnvelope, TaskStatus};

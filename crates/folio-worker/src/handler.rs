//! Task handler capability
//!
//! A handler owns one task name. The listener resolves it through the
//! [`HandlerRegistry`](crate::HandlerRegistry) and turns its outcome into an
//! acknowledge or requeue decision.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use folio_core::{MessageEnvelope, TaskStatus};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task name this handler is registered under.
    fn name(&self) -> &str;

    /// Handle one delivery of a task.
    ///
    /// Returning `Err` (or panicking) is treated the same as `Ok(TaskStatus::Error)`.
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<TaskStatus>;
}

/// Builds one handler instance for the registry.
pub type HandlerFactory = fn() -> Arc<dyn TaskHandler>;

/// Liveness check: does nothing and succeeds.
pub struct PingHandler;

#[async_trait]
impl TaskHandler for PingHandler {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Result<TaskStatus> {
        tracing::debug!(correlation_id = ?envelope.correlation_id, "pong");
        Ok(TaskStatus::Success)
    }
}

/// Logs the envelope it receives and succeeds.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Result<TaskStatus> {
        tracing::info!(
            correlation_id = ?envelope.correlation_id,
            record_identifier = ?envelope.record_identifier,
            retry_count = envelope.retry_count,
            properties = ?envelope.properties,
            "echo"
        );
        Ok(TaskStatus::Success)
    }
}

fn ping() -> Arc<dyn TaskHandler> {
    Arc::new(PingHandler)
}

fn echo() -> Arc<dyn TaskHandler> {
    Arc::new(EchoHandler)
}

static BUILTIN_HANDLERS: &[HandlerFactory] = &[ping, echo];

/// Handlers shipped with the worker.
pub fn builtin_handlers() -> &'static [HandlerFactory] {
    BUILTIN_HANDLERS
}

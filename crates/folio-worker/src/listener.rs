//! Task queue listener
//!
//! Receive, parse, look up the prior attempt, dispatch, persist, then settle:
//! `Success` and `Ignored` acknowledge the delivery, `Error` requeues it so the
//! broker's redelivery policy decides between another attempt and the
//! dead-letter queue.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use folio_broker::{BrokerResult, Delivery, MessageBroker, Payload, QueueConsumer};
use folio_core::{LogLevel, MessageEnvelope, QueueError, TaskStatus};
use folio_db::EnvelopeStore;

use crate::consumer::{DeliveryProcessor, ListenerHandle};
use crate::notify::StatusNotifier;
use crate::registry::HandlerRegistry;

/// Everything a listener needs besides its broker consumer.
#[derive(Clone)]
pub struct ListenerContext {
    pub registry: Arc<HandlerRegistry>,
    pub store: Arc<dyn EnvelopeStore>,
    pub notifier: Arc<dyn StatusNotifier>,
}

pub struct QueueListener {
    name: String,
    context: ListenerContext,
}

impl QueueListener {
    pub fn new(name: impl Into<String>, context: ListenerContext) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }

    /// Start consuming `queue` on its own connection.
    pub async fn start(
        name: impl Into<String>,
        broker: &dyn MessageBroker,
        queue: &str,
        context: ListenerContext,
    ) -> BrokerResult<ListenerHandle> {
        let name = name.into();
        ListenerHandle::spawn(name.clone(), broker, queue, Self::new(name, context)).await
    }

    /// Run the handler registered for the envelope's task name.
    ///
    /// Missing handlers, handler errors and handler panics all resolve to
    /// `TaskStatus::Error`.
    pub async fn dispatch(&self, envelope: &MessageEnvelope) -> TaskStatus {
        let Some(handler) = self.context.registry.get(&envelope.task_name) else {
            log_queue_error(
                &self.name,
                envelope,
                &QueueError::HandlerNotFound(envelope.task_name.clone()),
            );
            return TaskStatus::Error;
        };

        let failure = match AssertUnwindSafe(handler.handle(envelope))
            .catch_unwind()
            .await
        {
            Ok(Ok(status)) => return status,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        log_queue_error(
            &self.name,
            envelope,
            &QueueError::HandlerFailure {
                task_name: envelope.task_name.clone(),
                message: failure,
            },
        );
        TaskStatus::Error
    }

    async fn prior_attempt(&self, correlation_id: &str) -> Option<MessageEnvelope> {
        match self.context.store.load(correlation_id).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::error!(
                    listener = %self.name,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to load prior attempt, handling as first attempt"
                );
                None
            }
        }
    }

    async fn persist(&self, envelope: &MessageEnvelope) -> MessageEnvelope {
        match self.context.store.save(envelope).await {
            Ok(saved) => saved,
            Err(e) => {
                let err = QueueError::persistence("Failed to save message envelope", e);
                log_queue_error(&self.name, envelope, &err);
                envelope.clone()
            }
        }
    }
}

#[async_trait]
impl DeliveryProcessor for QueueListener {
    async fn process(&self, consumer: &dyn QueueConsumer, delivery: Delivery) {
        let parsed = match &delivery.payload {
            Payload::Text(text) => MessageEnvelope::from_json(text),
            Payload::Binary(bytes) => MessageEnvelope::from_json_bytes(bytes),
        };

        let mut envelope = match parsed {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    listener = %self.name,
                    message_id = %delivery.message_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Malformed task payload, returning it to the broker"
                );
                if let Err(e) = consumer.requeue(&delivery).await {
                    tracing::error!(
                        listener = %self.name,
                        message_id = %delivery.message_id,
                        error = %e,
                        "Failed to requeue malformed message"
                    );
                }
                return;
            }
        };

        envelope.id = None;
        envelope.retry_count = 0;
        envelope.correlation_id = Some(delivery.message_id.clone());
        if let Some(previous) = self.prior_attempt(&delivery.message_id).await {
            envelope.continue_from(&previous);
        }

        tracing::debug!(
            listener = %self.name,
            task_name = %envelope.task_name,
            correlation_id = %delivery.message_id,
            retry_count = envelope.retry_count,
            "Dispatching task"
        );

        let status = self.dispatch(&envelope).await;
        envelope.record_outcome(status);
        let envelope = self.persist(&envelope).await;

        let settled = if status.requires_requeue() {
            consumer.requeue(&delivery).await
        } else {
            consumer.acknowledge(&delivery).await
        };
        match settled {
            Ok(()) => tracing::info!(
                listener = %self.name,
                task_name = %envelope.task_name,
                correlation_id = %delivery.message_id,
                status = %status,
                retry_count = envelope.retry_count,
                "Task handled"
            ),
            Err(e) => tracing::error!(
                listener = %self.name,
                correlation_id = %delivery.message_id,
                status = %status,
                error = %e,
                "Failed to settle delivery"
            ),
        }

        self.context.notifier.notify(&envelope);
    }
}

fn log_queue_error(listener: &str, envelope: &MessageEnvelope, err: &QueueError) {
    let correlation_id = envelope.correlation_id.as_deref().unwrap_or("-");
    match err.log_level() {
        LogLevel::Debug => tracing::debug!(
            listener = %listener,
            task_name = %envelope.task_name,
            correlation_id = %correlation_id,
            error_code = err.error_code(),
            error = %err,
            "Task not handled"
        ),
        LogLevel::Warn => tracing::warn!(
            listener = %listener,
            task_name = %envelope.task_name,
            correlation_id = %correlation_id,
            error_code = err.error_code(),
            error = %err,
            "Task not handled"
        ),
        LogLevel::Error => tracing::error!(
            listener = %listener,
            task_name = %envelope.task_name,
            correlation_id = %correlation_id,
            error_code = err.error_code(),
            error = %err,
            "Task not handled"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Task queue lifecycle
//!
//! [`TaskQueueManager`] owns the embedded broker, the queue listeners, the
//! dead-letter listener and the optional management endpoint. It is created
//! explicitly and shared through an `Arc`; producers call
//! [`TaskQueueManager::submit`] from anywhere once it is running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use folio_broker::{EmbeddedBroker, MessageBroker, OutboundMessage, QueueStats};
use folio_core::{MessageEnvelope, QueueConfig, QueueError, QueueResult};
use folio_db::EnvelopeStore;

use crate::consumer::ListenerHandle;
use crate::dead_letter::{DeadLetterListener, DeadLetterLog, DeadLetterRecord};
use crate::listener::{ListenerContext, QueueListener};
use crate::management::{AdminCredentials, ManagementServer, ManagementState};
use crate::notify::StatusNotifier;
use crate::registry::HandlerRegistry;

#[derive(Clone)]
struct BrokerSlot {
    broker: Arc<dyn MessageBroker>,
    task_queue: String,
}

/// State shared between the manager and the management endpoint.
pub struct QueueRuntime {
    running: AtomicBool,
    broker: RwLock<Option<BrokerSlot>>,
    dead_letters: Arc<DeadLetterLog>,
}

impl QueueRuntime {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            broker: RwLock::new(None),
            dead_letters: Arc::new(DeadLetterLog::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::SeqCst)
    }

    pub(crate) async fn attach_broker(&self, broker: Arc<dyn MessageBroker>, task_queue: String) {
        *self.broker.write().await = Some(BrokerSlot { broker, task_queue });
    }

    pub(crate) async fn detach_broker(&self) {
        self.broker.write().await.take();
    }

    async fn broker_slot(&self) -> Option<BrokerSlot> {
        self.broker.read().await.clone()
    }

    /// Per-queue statistics; empty while no broker is attached.
    pub async fn queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        match self.broker_slot().await {
            Some(slot) => slot
                .broker
                .queue_stats()
                .await
                .map_err(|e| QueueError::Connectivity(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub fn dead_letter_log(&self) -> Arc<DeadLetterLog> {
        self.dead_letters.clone()
    }
}

impl Default for QueueRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Lifecycle {
    management: Option<ManagementServer>,
    broker: Option<Arc<dyn MessageBroker>>,
    listeners: Vec<ListenerHandle>,
    dead_letter_listener: Option<ListenerHandle>,
}

impl Lifecycle {
    fn is_empty(&self) -> bool {
        self.management.is_none()
            && self.broker.is_none()
            && self.listeners.is_empty()
            && self.dead_letter_listener.is_none()
    }
}

pub struct TaskQueueManager {
    runtime: Arc<QueueRuntime>,
    store: Arc<dyn EnvelopeStore>,
    notifier: Arc<dyn StatusNotifier>,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskQueueManager {
    pub fn new(store: Arc<dyn EnvelopeStore>, notifier: Arc<dyn StatusNotifier>) -> Self {
        Self {
            runtime: Arc::new(QueueRuntime::new()),
            store,
            notifier,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn runtime(&self) -> Arc<QueueRuntime> {
        self.runtime.clone()
    }

    /// Start the broker and `num_workers` listeners.
    ///
    /// Returns `false` if any phase fails; the failing phase is logged and the
    /// pieces already started stay up until [`shutdown`](Self::shutdown) or the
    /// next `initialize`. Returns `false` without side effects when already running.
    #[tracing::instrument(skip(self, config, registry))]
    pub async fn initialize(
        &self,
        config: &QueueConfig,
        registry: Arc<HandlerRegistry>,
        num_workers: usize,
    ) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.runtime.is_running() {
            tracing::warn!("Task queue is already running, ignoring initialize");
            return false;
        }
        if !lifecycle.is_empty() {
            tracing::info!("Releasing resources left by an earlier failed initialize");
            self.teardown(&mut lifecycle).await;
        }

        match self
            .start(&mut lifecycle, config, registry, num_workers)
            .await
        {
            Ok(()) => {
                self.runtime.set_running(true);
                tracing::info!(
                    num_workers,
                    broker = ?config.broker_name(),
                    management = ?config.management_addr,
                    "Task queue started"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    error_code = e.error_code(),
                    error = %e,
                    "Task queue initialization failed"
                );
                false
            }
        }
    }

    async fn start(
        &self,
        lifecycle: &mut Lifecycle,
        config: &QueueConfig,
        registry: Arc<HandlerRegistry>,
        num_workers: usize,
    ) -> QueueResult<()> {
        config.validate()?;
        if num_workers == 0 {
            return Err(QueueError::Configuration(
                "at least one queue worker is required".to_string(),
            ));
        }

        if let Some(addr) = &config.management_addr {
            let state = ManagementState::new(
                self.runtime.clone(),
                AdminCredentials::new(&config.broker_admin_user, &config.broker_admin_password),
            );
            let server = ManagementServer::bind(addr, state).await.map_err(|e| {
                QueueError::Configuration(format!("management endpoint: {:#}", e))
            })?;
            lifecycle.management = Some(server);
        }

        let broker = EmbeddedBroker::from_descriptor_path(&config.broker_descriptor_path)
            .map_err(|e| QueueError::Configuration(e.to_string()))?;
        if let Some(expected) = config.broker_name() {
            if broker.name() != expected {
                return Err(QueueError::Configuration(format!(
                    "connector URI addresses broker '{}' but the descriptor defines '{}'",
                    expected,
                    broker.name()
                )));
            }
        }
        let task_queue = broker.descriptor().task_queue.clone();
        let dead_letter_queue = broker.descriptor().dead_letter_queue.clone();

        let broker: Arc<dyn MessageBroker> = Arc::new(broker);
        broker
            .start()
            .await
            .map_err(|e| QueueError::Connectivity(e.to_string()))?;
        lifecycle.broker = Some(broker.clone());
        self.runtime
            .attach_broker(broker.clone(), task_queue.clone())
            .await;

        let context = ListenerContext {
            registry,
            store: self.store.clone(),
            notifier: self.notifier.clone(),
        };
        for index in 0..num_workers {
            let listener = QueueListener::start(
                format!("queue-listener-{}", index),
                broker.as_ref(),
                &task_queue,
                context.clone(),
            )
            .await
            .map_err(|e| QueueError::Connectivity(e.to_string()))?;
            lifecycle.listeners.push(listener);
        }

        let dead_letter_listener = DeadLetterListener::start(
            broker.as_ref(),
            &dead_letter_queue,
            self.runtime.dead_letter_log(),
        )
        .await
        .map_err(|e| QueueError::Connectivity(e.to_string()))?;
        lifecycle.dead_letter_listener = Some(dead_letter_listener);

        Ok(())
    }

    /// Publish an envelope to the task queue and return its correlation id.
    #[tracing::instrument(skip(self, envelope), fields(task_name = %envelope.task_name))]
    pub async fn submit(&self, envelope: &MessageEnvelope) -> QueueResult<String> {
        if !self.runtime.is_running() {
            return Err(QueueError::QueueUnavailable);
        }
        let slot = self
            .runtime
            .broker_slot()
            .await
            .ok_or(QueueError::QueueUnavailable)?;

        let body = envelope.to_json()?;
        let message = OutboundMessage::text(body).with_group(Uuid::new_v4().to_string());

        let connection = slot
            .broker
            .connect()
            .await
            .map_err(|e| QueueError::Connectivity(e.to_string()))?;
        let published = connection.publish(&slot.task_queue, message).await;
        connection.close().await;

        let correlation_id = published.map_err(|e| {
            tracing::error!(error = %e, "Failed to publish task");
            QueueError::Connectivity(e.to_string())
        })?;

        tracing::info!(
            correlation_id = %correlation_id,
            record_identifier = ?envelope.record_identifier,
            "Task submitted to queue"
        );
        Ok(correlation_id)
    }

    /// Build an envelope for `task_name` and submit it.
    pub async fn submit_task(
        &self,
        task_name: &str,
        record_identifier: Option<String>,
        properties: HashMap<String, String>,
    ) -> QueueResult<String> {
        let mut envelope = MessageEnvelope::new(task_name).with_properties(properties);
        envelope.record_identifier = record_identifier;
        self.submit(&envelope).await
    }

    /// Stop everything `initialize` started. Safe to call more than once.
    pub async fn shutdown(&self) {
        let was_running = self.runtime.set_running(false);
        let mut lifecycle = self.lifecycle.lock().await;
        if !was_running && lifecycle.is_empty() {
            return;
        }

        tracing::info!("Initiating task queue shutdown");
        self.teardown(&mut lifecycle).await;
        tracing::info!("Task queue stopped");
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        if let Some(server) = lifecycle.management.take() {
            server.shutdown().await;
        }

        let mut listeners: Vec<ListenerHandle> = lifecycle.listeners.drain(..).collect();
        listeners.extend(lifecycle.dead_letter_listener.take());
        futures::future::join_all(listeners.into_iter().map(ListenerHandle::close)).await;

        self.runtime.detach_broker().await;
        if let Some(broker) = lifecycle.broker.take() {
            if let Err(e) = broker.stop().await {
                tracing::error!(broker = %broker.name(), error = %e, "Failed to stop broker");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_running()
    }

    pub async fn queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        self.runtime.queue_stats().await
    }

    /// Poison messages observed by the dead-letter listener, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.runtime.dead_letters.records().await
    }
}

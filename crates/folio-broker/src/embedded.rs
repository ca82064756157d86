//! In-process broker
//!
//! Queues live in memory behind a single mutex; consumers park on a shared
//! `Notify` and re-check their queue whenever anything changes. A persistent
//! broker writes whatever is still unacknowledged to a JSON snapshot when it stops
//! and replays it on the next start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::descriptor::BrokerDescriptor;
use crate::error::{BrokerError, BrokerResult};
use crate::traits::{
    BrokerConnection, Delivery, MessageBroker, OutboundMessage, Payload, QueueConsumer,
    QueueStats,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message_id: String,
    group_id: Option<String>,
    payload: Payload,
    delivery_count: u32,
    original_queue: Option<String>,
    enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    not_before: Option<Instant>,
}

impl StoredMessage {
    fn is_available(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

struct InFlight {
    consumer_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
    consumers: HashMap<u64, usize>,
    enqueued_total: u64,
    dequeued_total: u64,
}

impl QueueState {
    fn in_flight_for(&self, consumer_id: u64) -> usize {
        self.in_flight
            .values()
            .filter(|f| f.consumer_id == consumer_id)
            .count()
    }

    fn group_held_by_other(&self, group_id: &str, consumer_id: u64) -> bool {
        self.in_flight.values().any(|f| {
            f.consumer_id != consumer_id && f.message.group_id.as_deref() == Some(group_id)
        })
    }

    fn take_next(
        &mut self,
        queue: &str,
        consumer_id: u64,
        prefetch: usize,
        now: Instant,
    ) -> Option<Delivery> {
        if self.in_flight_for(consumer_id) >= prefetch.max(1) {
            return None;
        }

        let position = self.ready.iter().position(|m| {
            m.is_available(now)
                && m
                    .group_id
                    .as_deref()
                    .map_or(true, |g| !self.group_held_by_other(g, consumer_id))
        })?;

        let mut message = self.ready.remove(position)?;
        message.delivery_count += 1;
        message.not_before = None;

        let delivery = Delivery {
            message_id: message.message_id.clone(),
            queue: queue.to_string(),
            payload: message.payload.clone(),
            group_id: message.group_id.clone(),
            delivery_count: message.delivery_count,
            original_queue: message.original_queue.clone(),
        };
        self.in_flight.insert(
            message.message_id.clone(),
            InFlight {
                consumer_id,
                message,
            },
        );
        Some(delivery)
    }

    fn settle(&mut self, consumer_id: u64, message_id: &str) -> BrokerResult<StoredMessage> {
        match self.in_flight.get(message_id) {
            Some(f) if f.consumer_id == consumer_id => {}
            _ => return Err(BrokerError::UnknownDelivery(message_id.to_string())),
        }
        self.in_flight
            .remove(message_id)
            .map(|f| f.message)
            .ok_or_else(|| BrokerError::UnknownDelivery(message_id.to_string()))
    }

    /// Put every unsettled delivery of `consumer_id` back at the head of the queue.
    fn release_consumer(&mut self, consumer_id: u64) -> usize {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.consumer_id == consumer_id)
            .map(|(id, _)| id.clone())
            .collect();
        self.requeue_in_flight(ids)
    }

    fn release_all(&mut self) -> usize {
        let ids: Vec<String> = self.in_flight.keys().cloned().collect();
        self.requeue_in_flight(ids)
    }

    fn requeue_in_flight(&mut self, ids: Vec<String>) -> usize {
        let mut messages: Vec<StoredMessage> = ids
            .iter()
            .filter_map(|id| self.in_flight.remove(id).map(|f| f.message))
            .collect();
        messages.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        let count = messages.len();
        for message in messages {
            self.ready.push_front(message);
        }
        count
    }

    fn earliest_delayed(&self, now: Instant) -> Option<Instant> {
        self.ready
            .iter()
            .filter_map(|m| m.not_before)
            .filter(|at| *at > now)
            .min()
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    broker_name: String,
    saved_at: DateTime<Utc>,
    queues: HashMap<String, Vec<StoredMessage>>,
}

struct BrokerShared {
    descriptor: BrokerDescriptor,
    id_prefix: String,
    running: AtomicBool,
    queues: Mutex<HashMap<String, QueueState>>,
    wakeup: Notify,
    next_consumer_id: AtomicU64,
}

impl BrokerShared {
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_running(&self) -> BrokerResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotRunning(self.descriptor.broker_name.clone()))
        }
    }

    fn next_message_id(&self) -> String {
        format!("ID:{}-{}", self.id_prefix, Uuid::new_v4())
    }

    fn publish(&self, queue: &str, message: OutboundMessage) -> BrokerResult<String> {
        self.ensure_running()?;
        let message_id = self.next_message_id();
        {
            let mut queues = self.lock_queues();
            let state = queues.entry(queue.to_string()).or_default();
            state.ready.push_back(StoredMessage {
                message_id: message_id.clone(),
                group_id: message.group_id,
                payload: message.payload,
                delivery_count: 0,
                original_queue: None,
                enqueued_at: Utc::now(),
                not_before: None,
            });
            state.enqueued_total += 1;
        }
        self.wakeup.notify_waiters();

        tracing::trace!(queue = %queue, message_id = %message_id, "Message enqueued");
        Ok(message_id)
    }

    fn requeue(&self, consumer_id: u64, delivery: &Delivery) -> BrokerResult<()> {
        let policy = self.descriptor.redelivery_policy;
        let dead_letter_queue = &self.descriptor.dead_letter_queue;

        {
            let mut queues = self.lock_queues();
            let state = queues
                .get_mut(&delivery.queue)
                .ok_or_else(|| BrokerError::UnknownDelivery(delivery.message_id.clone()))?;
            let mut message = state.settle(consumer_id, &delivery.message_id)?;

            if !policy.is_exhausted(message.delivery_count) {
                let delay = policy.redelivery_delay();
                message.not_before = (!delay.is_zero()).then(|| Instant::now() + delay);
                state.ready.push_front(message);
                tracing::debug!(
                    queue = %delivery.queue,
                    message_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    delay_ms = delay.as_millis() as u64,
                    "Message scheduled for redelivery"
                );
            } else {
                state.dequeued_total += 1;
                if delivery.queue == *dead_letter_queue {
                    tracing::warn!(
                        queue = %delivery.queue,
                        message_id = %delivery.message_id,
                        "Dead-lettered message rejected again, discarding"
                    );
                } else {
                    message.original_queue = Some(delivery.queue.clone());
                    message.delivery_count = 0;
                    message.not_before = None;
                    let dlq = queues.entry(dead_letter_queue.clone()).or_default();
                    dlq.ready.push_back(message);
                    dlq.enqueued_total += 1;
                    tracing::warn!(
                        queue = %delivery.queue,
                        dead_letter_queue = %dead_letter_queue,
                        message_id = %delivery.message_id,
                        delivery_count = delivery.delivery_count,
                        "Redeliveries exhausted, message moved to dead-letter queue"
                    );
                }
            }
        }

        self.wakeup.notify_waiters();
        Ok(())
    }
}

/// Broker running inside the current process.
#[derive(Clone)]
pub struct EmbeddedBroker {
    shared: Arc<BrokerShared>,
}

impl EmbeddedBroker {
    pub fn new(descriptor: BrokerDescriptor) -> BrokerResult<Self> {
        descriptor.validate()?;
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let id_prefix = format!("{}-{}", host, descriptor.broker_name);

        Ok(Self {
            shared: Arc::new(BrokerShared {
                descriptor,
                id_prefix,
                running: AtomicBool::new(false),
                queues: Mutex::new(HashMap::new()),
                wakeup: Notify::new(),
                next_consumer_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn from_descriptor_path(path: &Path) -> BrokerResult<Self> {
        Self::new(BrokerDescriptor::from_path(path)?)
    }

    pub fn descriptor(&self) -> &BrokerDescriptor {
        &self.shared.descriptor
    }

    async fn load_snapshot(&self) -> BrokerResult<HashMap<String, Vec<StoredMessage>>> {
        let Some(path) = self.shared.descriptor.snapshot_path() else {
            return Ok(HashMap::new());
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| BrokerError::Snapshot(format!("{}: {}", path.display(), e)))?;

        // Replayed messages must not be replayed a second time after a crash.
        tokio::fs::remove_file(&path).await?;

        tracing::info!(
            broker = %snapshot.broker_name,
            saved_at = %snapshot.saved_at,
            queues = snapshot.queues.len(),
            "Restored broker snapshot"
        );
        Ok(snapshot.queues)
    }

    async fn write_snapshot(&self, queues: HashMap<String, Vec<StoredMessage>>) -> BrokerResult<()> {
        let Some(path) = self.shared.descriptor.snapshot_path() else {
            return Ok(());
        };
        let pending: usize = queues.values().map(Vec::len).sum();
        let snapshot = Snapshot {
            broker_name: self.shared.descriptor.broker_name.clone(),
            saved_at: Utc::now(),
            queues,
        };
        let raw = serde_json::to_string(&snapshot)
            .map_err(|e| BrokerError::Snapshot(e.to_string()))?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, raw).await?;

        tracing::info!(path = %path.display(), pending, "Broker snapshot written");
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for EmbeddedBroker {
    fn name(&self) -> &str {
        &self.shared.descriptor.broker_name
    }

    async fn start(&self) -> BrokerResult<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let restored = self.load_snapshot().await?;
        let descriptor = &self.shared.descriptor;
        {
            let mut queues = self.shared.lock_queues();
            queues.entry(descriptor.task_queue.clone()).or_default();
            queues.entry(descriptor.dead_letter_queue.clone()).or_default();
            for (name, messages) in restored {
                let state = queues.entry(name).or_default();
                state.enqueued_total += messages.len() as u64;
                state.ready.extend(messages);
            }
        }
        self.shared.running.store(true, Ordering::SeqCst);

        tracing::info!(
            broker = %descriptor.broker_name,
            task_queue = %descriptor.task_queue,
            dead_letter_queue = %descriptor.dead_letter_queue,
            persistent = descriptor.persistent,
            maximum_redeliveries = descriptor.redelivery_policy.maximum_redeliveries,
            "Embedded broker started"
        );
        Ok(())
    }

    async fn stop(&self) -> BrokerResult<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let persistent = self.shared.descriptor.snapshot_path().is_some();
        let pending = {
            let mut queues = self.shared.lock_queues();
            let mut pending = HashMap::new();
            for (name, state) in queues.iter_mut() {
                state.release_all();
                state.consumers.clear();
                if persistent && !state.ready.is_empty() {
                    pending.insert(name.clone(), state.ready.drain(..).collect::<Vec<_>>());
                }
            }
            pending
        };
        self.shared.wakeup.notify_waiters();

        if persistent {
            self.write_snapshot(pending).await?;
        }

        tracing::info!(broker = %self.shared.descriptor.broker_name, "Embedded broker stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.shared.ensure_running()?;
        Ok(Arc::new(EmbeddedConnection {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        }))
    }

    async fn queue_stats(&self) -> BrokerResult<Vec<QueueStats>> {
        let queues = self.shared.lock_queues();
        let mut stats: Vec<QueueStats> = queues
            .iter()
            .map(|(name, state)| QueueStats {
                name: name.clone(),
                depth: state.ready.len(),
                in_flight: state.in_flight.len(),
                consumer_count: state.consumers.len(),
                enqueued_total: state.enqueued_total,
                dequeued_total: state.dequeued_total,
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}

struct EmbeddedConnection {
    shared: Arc<BrokerShared>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Arc<ConsumerCore>>>,
}

impl EmbeddedConnection {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.shared.ensure_running()
    }

    fn close_consumers(&self) {
        let consumers: Vec<Arc<ConsumerCore>> = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for consumer in consumers {
            consumer.close();
            consumer.release();
        }
    }
}

#[async_trait]
impl BrokerConnection for EmbeddedConnection {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> BrokerResult<String> {
        self.ensure_open()?;
        self.shared.publish(queue, message)
    }

    async fn create_consumer(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> BrokerResult<Arc<dyn QueueConsumer>> {
        self.ensure_open()?;
        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let prefetch = prefetch.max(1);
        self.shared
            .lock_queues()
            .entry(queue.to_string())
            .or_default()
            .consumers
            .insert(id, prefetch);

        let core = Arc::new(ConsumerCore {
            id,
            queue: queue.to_string(),
            prefetch,
            closed: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(core.clone());

        tracing::debug!(queue = %queue, consumer_id = id, prefetch, "Consumer opened");
        Ok(Arc::new(EmbeddedConsumer { core }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_consumers();
        }
    }
}

impl Drop for EmbeddedConnection {
    fn drop(&mut self) {
        self.close_consumers();
    }
}

struct ConsumerCore {
    id: u64,
    queue: String,
    prefetch: usize,
    closed: AtomicBool,
    shared: Arc<BrokerShared>,
}

impl ConsumerCore {
    /// Stop handing out deliveries and wake a pending `receive`. Deliveries
    /// already handed out stay settleable until [`ConsumerCore::release`].
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(state) = self.shared.lock_queues().get_mut(&self.queue) {
            state.consumers.remove(&self.id);
        }
        self.shared.wakeup.notify_waiters();

        tracing::debug!(queue = %self.queue, consumer_id = self.id, "Consumer closed");
    }

    /// Put whatever this consumer still holds back at the head of its queue.
    fn release(&self) {
        let returned = match self.shared.lock_queues().get_mut(&self.queue) {
            Some(state) => state.release_consumer(self.id),
            None => 0,
        };
        if returned > 0 {
            self.shared.wakeup.notify_waiters();
            tracing::debug!(
                queue = %self.queue,
                consumer_id = self.id,
                returned,
                "Unsettled deliveries returned to queue"
            );
        }
    }
}

enum Poll {
    Ready(Delivery),
    WaitUntil(Instant),
    Wait,
}

struct EmbeddedConsumer {
    core: Arc<ConsumerCore>,
}

#[async_trait]
impl QueueConsumer for EmbeddedConsumer {
    async fn receive(&self) -> BrokerResult<Option<Delivery>> {
        let core = &self.core;
        loop {
            let notified = core.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if core.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            core.shared.ensure_running()?;

            let poll = {
                let mut queues = core.shared.lock_queues();
                let state = queues.entry(core.queue.clone()).or_default();
                state.consumers.entry(core.id).or_insert(core.prefetch);
                let now = Instant::now();
                match state.take_next(&core.queue, core.id, core.prefetch, now) {
                    Some(delivery) => Poll::Ready(delivery),
                    None => match state.earliest_delayed(now) {
                        Some(at) => Poll::WaitUntil(at),
                        None => Poll::Wait,
                    },
                }
            };

            match poll {
                Poll::Ready(delivery) => return Ok(Some(delivery)),
                Poll::WaitUntil(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Poll::Wait => notified.await,
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) -> BrokerResult<()> {
        {
            let mut queues = self.core.shared.lock_queues();
            let state = queues
                .get_mut(&delivery.queue)
                .ok_or_else(|| BrokerError::UnknownDelivery(delivery.message_id.clone()))?;
            state.settle(self.core.id, &delivery.message_id)?;
            state.dequeued_total += 1;
        }
        self.core.shared.wakeup.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.core.shared.requeue(self.core.id, delivery)
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

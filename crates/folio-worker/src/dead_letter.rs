//! Dead-letter listener
//!
//! Consumes the dead-letter queue, records every poison message in a bounded
//! in-memory log and acknowledges it. Nothing is retried from here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use folio_broker::{BrokerResult, Delivery, MessageBroker, QueueConsumer};

use crate::consumer::{DeliveryProcessor, ListenerHandle};

/// Number of dead letters kept for inspection.
pub const DEAD_LETTER_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub original_queue: Option<String>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Most recent dead letters, oldest evicted first.
pub struct DeadLetterLog {
    capacity: usize,
    records: RwLock<VecDeque<DeadLetterRecord>>,
    total: AtomicU64,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: RwLock::new(VecDeque::new()),
            total: AtomicU64::new(0),
        }
    }

    pub async fn push(&self, record: DeadLetterRecord) {
        let mut records = self.records.write().await;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Retained records, oldest first.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    /// Dead letters seen since start, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for DeadLetterLog {
    fn default() -> Self {
        Self::new(DEAD_LETTER_LOG_CAPACITY)
    }
}

pub struct DeadLetterListener {
    name: String,
    log: Arc<DeadLetterLog>,
}

impl DeadLetterListener {
    pub async fn start(
        broker: &dyn MessageBroker,
        queue: &str,
        log: Arc<DeadLetterLog>,
    ) -> BrokerResult<ListenerHandle> {
        let name = "dead-letter-listener".to_string();
        ListenerHandle::spawn(
            name.clone(),
            broker,
            queue,
            DeadLetterListener { name, log },
        )
        .await
    }
}

#[async_trait]
impl DeliveryProcessor for DeadLetterListener {
    async fn process(&self, consumer: &dyn QueueConsumer, delivery: Delivery) {
        let payload = delivery.payload.to_text_lossy();
        tracing::warn!(
            listener = %self.name,
            message_id = %delivery.message_id,
            original_queue = ?delivery.original_queue,
            payload = %payload,
            "Dead-lettered message received"
        );

        self.log
            .push(DeadLetterRecord {
                message_id: delivery.message_id.clone(),
                original_queue: delivery.original_queue.clone(),
                payload,
                received_at: Utc::now(),
            })
            .await;

        if let Err(e) = consumer.acknowledge(&delivery).await {
            tracing::error!(
                listener = %self.name,
                message_id = %delivery.message_id,
                error = %e,
                "Failed to acknowledge dead-lettered message"
            );
        }
    }
}

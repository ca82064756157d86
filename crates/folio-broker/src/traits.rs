//! Transport abstraction traits
//!
//! Any durable queue (the embedded broker, a managed cloud queue, a file-backed
//! queue) can sit behind these traits. Consumers only need two verbs to settle a
//! delivery: [`QueueConsumer::acknowledge`] removes it for good and
//! [`QueueConsumer::requeue`] hands it back to the broker's redelivery policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::BrokerResult;

/// Message body as published by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text view of the payload; binary bodies are decoded lossily.
    pub fn to_text_lossy(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Payload,
    /// Messages sharing a group are delivered in order to one consumer at a time.
    pub group_id: Option<String>,
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(body.into()),
            group_id: None,
        }
    }

    pub fn binary(body: Vec<u8>) -> Self {
        Self {
            payload: Payload::Binary(body),
            group_id: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, identical for every delivery of the same message
    pub message_id: String,
    pub queue: String,
    pub payload: Payload,
    pub group_id: Option<String>,
    /// How many times this message has been handed to a consumer, this one included
    pub delivery_count: u32,
    /// Queue the message was published to, when it has since been dead-lettered
    pub original_queue: Option<String>,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    /// Messages waiting to be delivered
    pub depth: usize,
    /// Messages delivered but not yet settled
    pub in_flight: usize,
    pub consumer_count: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> BrokerResult<()>;

    async fn stop(&self) -> BrokerResult<()>;

    fn is_running(&self) -> bool;

    /// Open a new connection. Connections are cheap and meant to be short-lived
    /// for producers; every consumer loop owns its own.
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>>;

    async fn queue_stats(&self) -> BrokerResult<Vec<QueueStats>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Publish a message and return the broker-assigned message id.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> BrokerResult<String>;

    /// Open a consumer that holds at most `prefetch` unsettled deliveries.
    async fn create_consumer(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> BrokerResult<Arc<dyn QueueConsumer>>;

    /// Close the connection and every consumer opened through it.
    async fn close(&self);
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Wait for the next delivery. Returns `Ok(None)` once the consumer is closed.
    async fn receive(&self) -> BrokerResult<Option<Delivery>>;

    async fn acknowledge(&self, delivery: &Delivery) -> BrokerResult<()>;

    async fn requeue(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Close the consumer, waking a pending `receive`. Deliveries already
    /// handed out can still be settled; whatever is unsettled when the owning
    /// connection closes goes back to the queue.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

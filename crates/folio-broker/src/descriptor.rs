//! Broker descriptor
//!
//! A small JSON document naming the broker, its queues, where (if anywhere) it
//! keeps unacknowledged messages between restarts, and its redelivery policy:
//!
//! ```json
//! {
//!   "broker_name": "folio",
//!   "task_queue": "folio.tasks",
//!   "dead_letter_queue": "folio.tasks.dlq",
//!   "persistent": true,
//!   "data_directory": "/var/lib/folio/broker",
//!   "redelivery_policy": { "maximum_redeliveries": 0, "redelivery_delay_ms": 0 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BrokerError, BrokerResult};

/// Controls how often an unacknowledged message is offered again before it is
/// routed to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    #[serde(default)]
    pub maximum_redeliveries: u32,
    #[serde(default)]
    pub redelivery_delay_ms: u64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 0,
        }
    }
}

impl RedeliveryPolicy {
    /// Whether a message that has been delivered `delivery_count` times has used
    /// up its allowance.
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count > self.maximum_redeliveries
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDescriptor {
    pub broker_name: String,
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub data_directory: Option<PathBuf>,
    #[serde(default)]
    pub redelivery_policy: RedeliveryPolicy,
}

fn default_task_queue() -> String {
    "folio.tasks".to_string()
}

fn default_dead_letter_queue() -> String {
    "folio.tasks.dlq".to_string()
}

impl BrokerDescriptor {
    /// In-memory descriptor with default queues and zero redeliveries.
    pub fn new(broker_name: impl Into<String>) -> Self {
        Self {
            broker_name: broker_name.into(),
            task_queue: default_task_queue(),
            dead_letter_queue: default_dead_letter_queue(),
            persistent: false,
            data_directory: None,
            redelivery_policy: RedeliveryPolicy::default(),
        }
    }

    pub fn from_path(path: &Path) -> BrokerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Descriptor(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
            .map_err(|e| BrokerError::Descriptor(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(raw: &str) -> BrokerResult<Self> {
        let descriptor: BrokerDescriptor =
            serde_json::from_str(raw).map_err(|e| BrokerError::Descriptor(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.broker_name.trim().is_empty() {
            return Err(BrokerError::Descriptor(
                "broker_name must not be empty".to_string(),
            ));
        }
        if self.task_queue.trim().is_empty() || self.dead_letter_queue.trim().is_empty() {
            return Err(BrokerError::Descriptor(
                "queue names must not be empty".to_string(),
            ));
        }
        if self.task_queue == self.dead_letter_queue {
            return Err(BrokerError::Descriptor(
                "task_queue and dead_letter_queue must differ".to_string(),
            ));
        }
        if self.persistent && self.data_directory.is_none() {
            return Err(BrokerError::Descriptor(
                "persistent brokers need a data_directory".to_string(),
            ));
        }
        Ok(())
    }

    /// File the broker snapshots unacknowledged messages to, when persistent.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if !self.persistent {
            return None;
        }
        self.data_directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.snapshot.json", self.broker_name)))
    }
}

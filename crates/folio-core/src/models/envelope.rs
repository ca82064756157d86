use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::error::{QueueError, QueueResult};

/// Outcome of one handling attempt.
///
/// Only `Error` sends a message back to the broker for redelivery; `Success` and
/// `Ignored` both acknowledge it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    /// The handler looked at the task and decided there was nothing to do.
    Ignored,
    Error,
}

impl TaskStatus {
    pub fn requires_requeue(&self) -> bool {
        matches!(self, TaskStatus::Error)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Ignored => write!(f, "ignored"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TaskStatus::Success),
            "ignored" => Ok(TaskStatus::Ignored),
            "error" => Ok(TaskStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// Persisted description of one task and its most recent handling attempt.
///
/// Producers build an envelope in memory and submit it; the broker assigns the
/// `correlation_id`, and the listener persists it on the first attempt. Later
/// attempts for the same correlation id update the same row (same `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub task_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_identifier: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl MessageEnvelope {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            id: None,
            correlation_id: None,
            task_name: task_name.into(),
            record_identifier: None,
            properties: HashMap::new(),
            retry_count: 0,
            status: None,
            last_update_time: None,
        }
    }

    pub fn with_record_identifier(mut self, record_identifier: impl Into<String>) -> Self {
        self.record_identifier = Some(record_identifier.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Adopt the persisted identity of an earlier attempt of the same message.
    pub fn continue_from(&mut self, previous: &MessageEnvelope) {
        self.id = previous.id;
        self.retry_count = previous.retry_count + 1;
    }

    pub fn record_outcome(&mut self, status: TaskStatus) {
        self.status = Some(status);
        self.last_update_time = Some(Utc::now());
    }

    pub fn is_redelivery(&self) -> bool {
        self.retry_count > 0
    }

    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> QueueResult<Self> {
        let envelope: MessageEnvelope = serde_json::from_str(payload)?;
        if envelope.task_name.trim().is_empty() {
            return Err(QueueError::MalformedPayload(
                "task_name must not be empty".to_string(),
            ));
        }
        Ok(envelope)
    }

    pub fn from_json_bytes(payload: &[u8]) -> QueueResult<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| QueueError::MalformedPayload(format!("payload is not UTF-8: {}", e)))?;
        Self::from_json(text)
    }
}

//! Status change notification
//!
//! Listeners call [`StatusNotifier::notify`] after every persisted status change.
//! Notification is fire-and-forget: implementations must not block the listener
//! and their failures never affect how a message is settled.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

use folio_core::{MessageEnvelope, TaskStatus};

pub trait StatusNotifier: Send + Sync {
    fn notify(&self, envelope: &MessageEnvelope);
}

/// Notifier that drops every event.
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {
    fn notify(&self, _envelope: &MessageEnvelope) {}
}

/// Forwards envelopes to an in-process channel.
///
/// Events are dropped (with a warning) when the channel is full or closed.
pub struct ChannelNotifier {
    sender: mpsc::Sender<MessageEnvelope>,
}

impl ChannelNotifier {
    pub fn new(sender: mpsc::Sender<MessageEnvelope>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MessageEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

impl StatusNotifier for ChannelNotifier {
    fn notify(&self, envelope: &MessageEnvelope) {
        if let Err(e) = self.sender.try_send(envelope.clone()) {
            tracing::warn!(
                error = %e,
                correlation_id = ?envelope.correlation_id,
                "Dropped status notification"
            );
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub event: &'static str,
    pub correlation_id: Option<String>,
    pub task_name: String,
    pub record_identifier: Option<String>,
    pub status: Option<TaskStatus>,
    pub retry_count: i32,
    pub timestamp: DateTime<Utc>,
}

impl From<&MessageEnvelope> for StatusEvent {
    fn from(envelope: &MessageEnvelope) -> Self {
        Self {
            event: "task.status_changed",
            correlation_id: envelope.correlation_id.clone(),
            task_name: envelope.task_name.clone(),
            record_identifier: envelope.record_identifier.clone(),
            status: envelope.status,
            retry_count: envelope.retry_count,
            timestamp: envelope.last_update_time.unwrap_or_else(Utc::now),
        }
    }
}

/// POSTs a [`StatusEvent`] as JSON to a fixed URL from a background task.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to create HTTP client for status notifications")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn deliver(client: Client, url: String, event: StatusEvent) -> Result<()> {
        let response = client
            .post(&url)
            .header("User-Agent", "Folio-Notifier/1.0")
            .json(&event)
            .send()
            .await
            .context("Failed to send status notification")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Status notification returned non-2xx status: {}", status);
        }
        Ok(())
    }
}

impl StatusNotifier for WebhookNotifier {
    fn notify(&self, envelope: &MessageEnvelope) {
        let event = StatusEvent::from(envelope);
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let correlation_id = event.correlation_id.clone();
            if let Err(e) = Self::deliver(client, url, event).await {
                tracing::warn!(
                    error = %e,
                    correlation_id = ?correlation_id,
                    "Status notification failed"
                );
            }
        });
    }
}

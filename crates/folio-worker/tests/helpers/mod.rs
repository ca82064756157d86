//! Shared setup for task queue integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use folio_broker::QueueStats;
use folio_core::{MessageEnvelope, QueueConfig};
use folio_db::InMemoryEnvelopeStore;
use folio_worker::{ChannelNotifier, HandlerFactory, HandlerRegistry, TaskQueueManager};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const TASK_QUEUE: &str = "folio.tasks";
pub const DEAD_LETTER_QUEUE: &str = "folio.tasks.dlq";

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn write_descriptor(dir: &Path, maximum_redeliveries: u32) -> PathBuf {
    write_descriptor_with(dir, maximum_redeliveries, None)
}

/// Descriptor for a broker that snapshots unsettled messages under `data_directory`.
pub fn write_persistent_descriptor(dir: &Path, data_directory: &Path) -> PathBuf {
    write_descriptor_with(dir, 0, Some(data_directory))
}

fn write_descriptor_with(
    dir: &Path,
    maximum_redeliveries: u32,
    data_directory: Option<&Path>,
) -> PathBuf {
    let path = dir.join("broker.json");
    let descriptor = serde_json::json!({
        "broker_name": "folio",
        "task_queue": TASK_QUEUE,
        "dead_letter_queue": DEAD_LETTER_QUEUE,
        "persistent": data_directory.is_some(),
        "data_directory": data_directory,
        "redelivery_policy": {
            "maximum_redeliveries": maximum_redeliveries,
            "redelivery_delay_ms": 0
        }
    });
    std::fs::write(&path, descriptor.to_string()).expect("Failed to write broker descriptor");
    path
}

pub fn config_for(descriptor: &Path) -> QueueConfig {
    let vars: HashMap<&str, String> = HashMap::from([
        ("FOLIO_BROKER_CONNECTOR_URI", "vm://folio".to_string()),
        ("FOLIO_BROKER_ADMIN_USER", "admin".to_string()),
        ("FOLIO_BROKER_ADMIN_PASSWORD", "admin-password".to_string()),
        (
            "FOLIO_BROKER_DESCRIPTOR",
            descriptor.to_string_lossy().into_owned(),
        ),
        ("ENVIRONMENT", "test".to_string()),
    ]);
    QueueConfig::from_vars(|key| vars.get(key).cloned()).expect("Failed to build test config")
}

pub struct TestQueue {
    pub manager: Arc<TaskQueueManager>,
    pub store: Arc<InMemoryEnvelopeStore>,
    pub events: mpsc::Receiver<MessageEnvelope>,
    pub config: QueueConfig,
    pub registry: Arc<HandlerRegistry>,
    _dir: TempDir,
}

/// Build a manager over a fresh broker descriptor without starting it.
pub fn test_queue(factories: &[HandlerFactory], maximum_redeliveries: u32) -> TestQueue {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let descriptor = write_descriptor(dir.path(), maximum_redeliveries);
    build_queue(factories, dir, &descriptor)
}

/// Like [`test_queue`], but the broker keeps unsettled messages across restarts.
pub fn persistent_test_queue(factories: &[HandlerFactory]) -> TestQueue {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let descriptor = write_persistent_descriptor(dir.path(), &dir.path().join("data"));
    build_queue(factories, dir, &descriptor)
}

fn build_queue(factories: &[HandlerFactory], dir: TempDir, descriptor: &Path) -> TestQueue {
    let config = config_for(descriptor);

    let store = Arc::new(InMemoryEnvelopeStore::new());
    let (notifier, events) = ChannelNotifier::channel(1024);
    let manager = Arc::new(TaskQueueManager::new(store.clone(), Arc::new(notifier)));

    TestQueue {
        manager,
        store,
        events,
        config,
        registry: Arc::new(HandlerRegistry::from_factories(factories)),
        _dir: dir,
    }
}

/// Build and start a manager with `workers` queue listeners.
pub async fn start_queue(
    factories: &[HandlerFactory],
    workers: usize,
    maximum_redeliveries: u32,
) -> TestQueue {
    let queue = test_queue(factories, maximum_redeliveries);
    assert!(
        queue
            .manager
            .initialize(&queue.config, queue.registry.clone(), workers)
            .await,
        "task queue failed to initialize"
    );
    queue
}

impl TestQueue {
    /// Next status notification, failing the test if none arrives in time.
    pub async fn next_event(&mut self) -> MessageEnvelope {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("Timed out waiting for a status notification")
            .expect("Notification channel closed")
    }

    /// Assert that no notification arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(window, self.events.recv()).await {
            panic!("unexpected status notification: {:?}", event);
        }
    }

    pub async fn stats(&self, queue: &str) -> QueueStats {
        self.manager
            .queue_stats()
            .await
            .expect("Failed to read queue statistics")
            .into_iter()
            .find(|s| s.name == queue)
            .unwrap_or_default()
    }

    /// Poll until the dead-letter listener has recorded `count` messages.
    pub async fn wait_for_dead_letters(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        while self.manager.dead_letters().await.len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for {} dead letters",
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

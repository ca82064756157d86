use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use folio_broker::{BrokerDescriptor, EmbeddedBroker, MessageBroker, OutboundMessage, QueueStats};
use folio_core::{MessageEnvelope, TaskStatus};
use folio_db::{EnvelopeStore, InMemoryEnvelopeStore};
use folio_worker::{
    builtin_handlers, ChannelNotifier, DeadLetterListener, DeadLetterLog, HandlerRegistry,
    ListenerContext, NoopNotifier, QueueListener, TaskHandler,
};

const TASKS: &str = "folio.tasks";
const DLQ: &str = "folio.tasks.dlq";

async fn broker() -> EmbeddedBroker {
    let broker = EmbeddedBroker::new(BrokerDescriptor::new("folio")).unwrap();
    broker.start().await.unwrap();
    broker
}

async fn stats(broker: &EmbeddedBroker, queue: &str) -> QueueStats {
    broker
        .queue_stats()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.name == queue)
        .unwrap_or_default()
}

async fn wait_for_dead_letters(log: &DeadLetterLog, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while log.records().await.len() < count {
        assert!(tokio::time::Instant::now() < deadline, "dead letters not recorded in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_rows(store: &InMemoryEnvelopeStore, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.len().await < count {
        assert!(tokio::time::Instant::now() < deadline, "envelopes not saved in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Store whose every call fails.
struct BrokenStore;

#[async_trait]
impl EnvelopeStore for BrokenStore {
    async fn load(&self, _correlation_id: &str) -> Result<Option<MessageEnvelope>> {
        anyhow::bail!("connection refused")
    }

    async fn save(&self, _envelope: &MessageEnvelope) -> Result<MessageEnvelope> {
        anyhow::bail!("connection refused")
    }
}

static SLOW_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Takes a while, then succeeds.
struct Slow;

#[async_trait]
impl TaskHandler for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn handle(&self, _envelope: &MessageEnvelope) -> Result<TaskStatus> {
        SLOW_CALLS.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(TaskStatus::Success)
    }
}

struct Explodes;

#[async_trait]
impl TaskHandler for Explodes {
    fn name(&self) -> &str {
        "explodes"
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Result<TaskStatus> {
        if envelope.property("mode") == Some("panic") {
            panic!("handler panicked");
        }
        anyhow::bail!("handler failed")
    }
}

fn explodes() -> Arc<dyn TaskHandler> {
    Arc::new(Explodes)
}

fn slow() -> Arc<dyn TaskHandler> {
    Arc::new(Slow)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_payloads_are_returned_to_broker() {
    let broker = broker().await;
    let store = Arc::new(InMemoryEnvelopeStore::new());
    let dead_letters = Arc::new(DeadLetterLog::default());

    let listener = QueueListener::start(
        "listener-0",
        &broker,
        TASKS,
        ListenerContext {
            registry: Arc::new(HandlerRegistry::from_factories(builtin_handlers())),
            store: store.clone(),
            notifier: Arc::new(NoopNotifier),
        },
    )
    .await
    .unwrap();
    let dead_letter_listener = DeadLetterListener::start(&broker, DLQ, dead_letters.clone())
        .await
        .unwrap();

    let conn = broker.connect().await.unwrap();
    conn.publish(TASKS, OutboundMessage::text("not json"))
        .await
        .unwrap();
    conn.publish(TASKS, OutboundMessage::binary(vec![0xff, 0x00, 0xfe]))
        .await
        .unwrap();
    let valid = MessageEnvelope::new("ping").to_json().unwrap();
    conn.publish(TASKS, OutboundMessage::binary(valid.into_bytes()))
        .await
        .unwrap();
    conn.close().await;

    wait_for_dead_letters(&dead_letters, 2).await;

    let records = dead_letters.records().await;
    assert!(records.iter().any(|r| r.payload == "not json"));
    assert!(records.iter().any(|r| r.payload.contains('\u{fffd}')));

    wait_for_rows(&store, 1).await;
    assert_eq!(store.all().await[0].status, Some(TaskStatus::Success));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats(&broker, TASKS).await.dequeued_total < 3
        || stats(&broker, DLQ).await.dequeued_total < 2
    {
        assert!(tokio::time::Instant::now() < deadline, "queues did not drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats(&broker, TASKS).await.depth, 0);
    assert_eq!(stats(&broker, DLQ).await.enqueued_total, 2);

    listener.close().await;
    dead_letter_listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistence_failure_does_not_change_settlement() {
    let broker = broker().await;
    let (notifier, mut events) = ChannelNotifier::channel(8);

    let listener = QueueListener::start(
        "listener-0",
        &broker,
        TASKS,
        ListenerContext {
            registry: Arc::new(HandlerRegistry::from_factories(builtin_handlers())),
            store: Arc::new(BrokenStore),
            notifier: Arc::new(notifier),
        },
    )
    .await
    .unwrap();

    let conn = broker.connect().await.unwrap();
    let correlation_id = conn
        .publish(
            TASKS,
            OutboundMessage::text(MessageEnvelope::new("echo").to_json().unwrap()),
        )
        .await
        .unwrap();
    conn.close().await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, Some(TaskStatus::Success));
    assert_eq!(event.correlation_id, Some(correlation_id));
    assert_eq!(event.id, None);

    let tasks = stats(&broker, TASKS).await;
    assert_eq!(tasks.depth, 0);
    assert_eq!(tasks.dequeued_total, 1);
    assert_eq!(stats(&broker, DLQ).await.enqueued_total, 0);

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_unblocks_idle_listener() {
    let broker = broker().await;
    let listener = QueueListener::start(
        "idle",
        &broker,
        TASKS,
        ListenerContext {
            registry: Arc::new(HandlerRegistry::empty()),
            store: Arc::new(InMemoryEnvelopeStore::new()),
            notifier: Arc::new(NoopNotifier),
        },
    )
    .await
    .unwrap();
    assert_eq!(listener.name(), "idle");
    assert_eq!(stats(&broker, TASKS).await.consumer_count, 1);

    let started = tokio::time::Instant::now();
    listener.close().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stats(&broker, TASKS).await.consumer_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_survives_broker_restart() {
    let broker = broker().await;
    let (notifier, mut events) = ChannelNotifier::channel(8);
    let listener = QueueListener::start(
        "restart",
        &broker,
        TASKS,
        ListenerContext {
            registry: Arc::new(HandlerRegistry::from_factories(builtin_handlers())),
            store: Arc::new(InMemoryEnvelopeStore::new()),
            notifier: Arc::new(notifier),
        },
    )
    .await
    .unwrap();

    broker.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.start().await.unwrap();

    let conn = broker.connect().await.unwrap();
    conn.publish(
        TASKS,
        OutboundMessage::text(MessageEnvelope::new("ping").to_json().unwrap()),
    )
    .await
    .unwrap();
    conn.close().await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, Some(TaskStatus::Success));
    assert!(!listener.is_finished());

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_lets_in_flight_success_settle() {
    let broker = broker().await;
    let store = Arc::new(InMemoryEnvelopeStore::new());
    let listener = QueueListener::start(
        "draining",
        &broker,
        TASKS,
        ListenerContext {
            registry: Arc::new(HandlerRegistry::from_factories(&[slow])),
            store: store.clone(),
            notifier: Arc::new(NoopNotifier),
        },
    )
    .await
    .unwrap();

    let conn = broker.connect().await.unwrap();
    conn.publish(
        TASKS,
        OutboundMessage::text(MessageEnvelope::new("slow").to_json().unwrap()),
    )
    .await
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while SLOW_CALLS.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "handler never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A second consumer on the same queue must not see the delivery the
    // closing listener is still working on.
    let other = conn.create_consumer(TASKS, 1).await.unwrap();
    listener.close().await;

    let stolen = tokio::time::timeout(Duration::from_millis(300), other.receive()).await;
    assert!(stolen.is_err(), "in-flight delivery was handed to another consumer");

    let tasks = stats(&broker, TASKS).await;
    assert_eq!(tasks.depth, 0);
    assert_eq!(tasks.in_flight, 0);
    assert_eq!(tasks.dequeued_total, 1);
    assert_eq!(SLOW_CALLS.load(Ordering::SeqCst), 1);

    let saved = store.all().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].status, Some(TaskStatus::Success));

    conn.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_and_panicking_handlers_keep_listener_alive() {
    let broker = broker().await;
    let store = Arc::new(InMemoryEnvelopeStore::new());
    let listener = QueueListener::start(
        "resilient",
        &broker,
        TASKS,
        ListenerContext {
            registry: Arc::new(HandlerRegistry::from_factories(&[explodes, slow])),
            store: store.clone(),
            notifier: Arc::new(NoopNotifier),
        },
    )
    .await
    .unwrap();

    let conn = broker.connect().await.unwrap();
    for (count, mode) in [(1, "error"), (2, "panic")] {
        let envelope = MessageEnvelope::new("explodes").with_property("mode", mode);
        let correlation_id = conn
            .publish(TASKS, OutboundMessage::text(envelope.to_json().unwrap()))
            .await
            .unwrap();

        wait_for_rows(&store, count).await;
        let saved = store.load(&correlation_id).await.unwrap().unwrap();
        assert_eq!(saved.status, Some(TaskStatus::Error));
        assert_eq!(saved.retry_count, 0);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stats(&broker, DLQ).await.enqueued_total < count as u64 {
            assert!(tokio::time::Instant::now() < deadline, "message not dead-lettered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats(&broker, DLQ).await.enqueued_total, count as u64);
        assert!(!listener.is_finished());
    }
    conn.close().await;

    let tasks = stats(&broker, TASKS).await;
    assert_eq!(tasks.depth, 0);
    assert_eq!(tasks.in_flight, 0);

    listener.close().await;
}

mod helpers;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use folio_core::{MessageEnvelope, TaskStatus};
use folio_worker::TaskHandler;
use helpers::{start_queue, DEAD_LETTER_QUEUE, TASK_QUEUE};

/// Fails until the message has been redelivered twice.
struct Flaky;

#[async_trait]
impl TaskHandler for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Result<TaskStatus> {
        if envelope.retry_count < 2 {
            anyhow::bail!("attempt {} failed", envelope.retry_count);
        }
        Ok(TaskStatus::Success)
    }
}

struct Broken;

#[async_trait]
impl TaskHandler for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn handle(&self, _envelope: &MessageEnvelope) -> Result<TaskStatus> {
        Ok(TaskStatus::Error)
    }
}

fn flaky() -> Arc<dyn TaskHandler> {
    Arc::new(Flaky)
}

fn broken() -> Arc<dyn TaskHandler> {
    Arc::new(Broken)
}

/// Each redelivery updates the same row and bumps retry_count by exactly one
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redelivery_increments_retry_count() {
    let mut queue = start_queue(&[flaky, broken], 2, 2).await;

    let correlation_id = queue
        .manager
        .submit_task("flaky", Some("record-9".to_string()), HashMap::new())
        .await
        .unwrap();

    let attempts: Vec<MessageEnvelope> = vec![
        queue.next_event().await,
        queue.next_event().await,
        queue.next_event().await,
    ];
    let retry_counts: Vec<i32> = attempts.iter().map(|e| e.retry_count).collect();
    let statuses: Vec<Option<TaskStatus>> = attempts.iter().map(|e| e.status).collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    assert_eq!(
        statuses,
        vec![
            Some(TaskStatus::Error),
            Some(TaskStatus::Error),
            Some(TaskStatus::Success)
        ]
    );

    let first_id = attempts[0].id;
    assert!(first_id.is_some());
    assert!(attempts.iter().all(|e| e.id == first_id));
    assert!(attempts
        .iter()
        .all(|e| e.correlation_id.as_deref() == Some(correlation_id.as_str())));

    let saved = queue.store.all().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].retry_count, 2);
    assert_eq!(saved[0].status, Some(TaskStatus::Success));

    assert_eq!(queue.stats(TASK_QUEUE).await.depth, 0);
    assert_eq!(queue.stats(DEAD_LETTER_QUEUE).await.enqueued_total, 0);

    queue.manager.shutdown().await;
}

/// Once the redelivery allowance is used up the message moves to the DLQ
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_redeliveries_reach_dead_letter_queue() {
    let mut queue = start_queue(&[flaky, broken], 1, 1).await;

    let correlation_id = queue
        .manager
        .submit_task("broken", None, HashMap::new())
        .await
        .unwrap();

    assert_eq!(queue.next_event().await.retry_count, 0);
    assert_eq!(queue.next_event().await.retry_count, 1);
    queue.assert_quiet(Duration::from_millis(200)).await;

    queue.wait_for_dead_letters(1).await;
    assert_eq!(queue.manager.dead_letters().await[0].message_id, correlation_id);
    assert_eq!(queue.stats(DEAD_LETTER_QUEUE).await.enqueued_total, 1);

    let saved = queue.store.all().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].retry_count, 1);
    assert_eq!(saved[0].status, Some(TaskStatus::Error));

    queue.manager.shutdown().await;
}

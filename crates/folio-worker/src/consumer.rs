//! Shared consume loop
//!
//! Every listener is a tokio task that owns one broker connection and one
//! prefetch-1 consumer, and hands each delivery to a [`DeliveryProcessor`]. The
//! loop stops when its cancellation token fires or its consumer is closed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use folio_broker::{BrokerConnection, BrokerResult, Delivery, MessageBroker, QueueConsumer};

/// Pause after a transient receive failure before trying again.
pub const RECEIVE_BACKOFF: Duration = Duration::from_millis(1500);

/// How long `close()` waits for the listener task before detaching it.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait DeliveryProcessor: Send + Sync + 'static {
    /// Handle one delivery and settle it on `consumer`.
    async fn process(&self, consumer: &dyn QueueConsumer, delivery: Delivery);
}

/// Running listener task.
pub struct ListenerHandle {
    name: String,
    cancel: CancellationToken,
    connection: Arc<dyn BrokerConnection>,
    consumer: Arc<dyn QueueConsumer>,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    /// Connect to `broker`, open a prefetch-1 consumer on `queue` and start the loop.
    pub async fn spawn<P: DeliveryProcessor>(
        name: impl Into<String>,
        broker: &dyn MessageBroker,
        queue: &str,
        processor: P,
    ) -> BrokerResult<Self> {
        let name = name.into();
        let connection = broker.connect().await?;
        let consumer = match connection.create_consumer(queue, 1).await {
            Ok(consumer) => consumer,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run(
            name.clone(),
            consumer.clone(),
            processor,
            cancel.clone(),
        ));

        tracing::info!(listener = %name, queue = %queue, "Listener started");
        Ok(Self {
            name,
            cancel,
            connection,
            consumer,
            join,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and release the broker resources.
    ///
    /// Waits up to [`CLOSE_TIMEOUT`] for the task, which may still settle the
    /// delivery it is working on. A task still busy after that is left to
    /// finish on its own and its delivery goes back to the queue.
    pub async fn close(self) {
        self.cancel.cancel();
        self.consumer.close();

        match tokio::time::timeout(CLOSE_TIMEOUT, self.join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(listener = %self.name, error = %e, "Listener task ended abnormally");
            }
            Err(_) => {
                tracing::warn!(
                    listener = %self.name,
                    timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                    "Listener did not stop in time, detaching"
                );
            }
        }

        self.connection.close().await;
        tracing::info!(listener = %self.name, "Listener closed");
    }
}

async fn run<P: DeliveryProcessor>(
    name: String,
    consumer: Arc<dyn QueueConsumer>,
    processor: P,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = consumer.receive() => received,
        };

        match received {
            Ok(Some(delivery)) => processor.process(consumer.as_ref(), delivery).await,
            Ok(None) => break,
            Err(e) if cancel.is_cancelled() => {
                tracing::debug!(listener = %name, error = %e, "Receive interrupted by shutdown");
                break;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    listener = %name,
                    error = %e,
                    backoff_ms = RECEIVE_BACKOFF.as_millis() as u64,
                    "Receive failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                }
            }
            Err(e) => {
                tracing::error!(listener = %name, error = %e, "Receive failed, listener stopping");
                break;
            }
        }
    }

    tracing::debug!(listener = %name, "Listener loop exited");
}

//! Folio Worker – broker-backed task queue.
//!
//! [`TaskQueueManager`] starts an embedded broker, a pool of [`QueueListener`]s
//! and a [`DeadLetterListener`]. Listeners resolve each task through the
//! [`HandlerRegistry`], persist the attempt through an
//! [`EnvelopeStore`](folio_db::EnvelopeStore) and settle the delivery with the
//! broker.

pub mod consumer;
pub mod dead_letter;
pub mod handler;
pub mod listener;
pub mod management;
pub mod manager;
pub mod notify;
pub mod registry;

pub use consumer::{DeliveryProcessor, ListenerHandle, CLOSE_TIMEOUT, RECEIVE_BACKOFF};
pub use dead_letter::{DeadLetterListener, DeadLetterLog, DeadLetterRecord};
pub use handler::{builtin_handlers, EchoHandler, HandlerFactory, PingHandler, TaskHandler};
pub use listener::{ListenerContext, QueueListener};
pub use management::{AdminCredentials, ManagementServer, ManagementState};
pub use manager::{QueueRuntime, TaskQueueManager};
pub use notify::{ChannelNotifier, NoopNotifier, StatusEvent, StatusNotifier, WebhookNotifier};
pub use registry::HandlerRegistry;

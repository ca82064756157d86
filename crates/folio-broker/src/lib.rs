//! Folio Broker – durable queue transport.
//!
//! The task queue talks to its transport only through the traits in [`traits`]:
//! a broker hands out short-lived connections, connections publish messages and
//! open consumers, and consumers receive, acknowledge or requeue deliveries.
//! [`EmbeddedBroker`] is the in-process implementation, configured by a JSON
//! [`BrokerDescriptor`].

mod descriptor;
mod embedded;
mod error;
pub mod traits;

pub use descriptor::{BrokerDescriptor, RedeliveryPolicy};
pub use embedded::EmbeddedBroker;
pub use error::{BrokerError, BrokerResult};
pub use traits::{
    BrokerConnection, Delivery, MessageBroker, OutboundMessage, Payload, QueueConsumer,
    QueueStats,
};

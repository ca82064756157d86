//! Message envelope persistence
//!
//! An envelope row is created on the first handling attempt of a broker message
//! and updated in place on every later attempt. Rows are looked up by the broker
//! message id (the envelope's correlation id).

mod memory;
mod postgres;

pub use memory::InMemoryEnvelopeStore;
pub use postgres::PgEnvelopeStore;

use anyhow::Result;
use async_trait::async_trait;
use folio_core::MessageEnvelope;

#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Most recent envelope persisted for `correlation_id`, if any.
    async fn load(&self, correlation_id: &str) -> Result<Option<MessageEnvelope>>;

    /// Insert the envelope when it has no `id` yet, otherwise update the row with
    /// that `id`. Returns the envelope with its `id` set.
    async fn save(&self, envelope: &MessageEnvelope) -> Result<MessageEnvelope>;
}

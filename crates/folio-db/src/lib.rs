//! Folio Database Layer
//!
//! Persistence for message envelopes: the [`EnvelopeStore`] trait the task queue
//! depends on, a Postgres implementation and an in-memory one.

pub mod envelope;

pub use envelope::{EnvelopeStore, InMemoryEnvelopeStore, PgEnvelopeStore};

/// Embedded migrations for the envelope tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

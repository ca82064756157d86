//! Envelope store setup

use anyhow::{Context, Result};
use folio_core::QueueConfig;
use folio_db::{EnvelopeStore, InMemoryEnvelopeStore, PgEnvelopeStore, MIGRATOR};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

/// Connect to Postgres and run migrations, or fall back to the in-memory store
/// when no database is configured.
pub async fn setup_store(config: &QueueConfig) -> Result<Arc<dyn EnvelopeStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, message envelopes are kept in memory only");
        return Ok(Arc::new(InMemoryEnvelopeStore::new()));
    };

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Database connected successfully"
    );

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(Arc::new(PgEnvelopeStore::new(pool)))
}

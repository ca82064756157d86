use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use std::collections::HashMap;

use folio_core::{MessageEnvelope, TaskStatus};

use super::EnvelopeStore;

#[derive(Debug, sqlx::FromRow)]
struct EnvelopeRow {
    id: i64,
    record_identifier: Option<String>,
    task_name: String,
    broker_message_id: Option<String>,
    retry_count: i32,
    status: Option<String>,
    last_update_time: Option<DateTime<Utc>>,
}

impl EnvelopeRow {
    fn into_envelope(self, properties: Vec<(String, String)>) -> Result<MessageEnvelope> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()
            .with_context(|| format!("Message envelope {} has an unknown status", self.id))?;

        Ok(MessageEnvelope {
            id: Some(self.id),
            correlation_id: self.broker_message_id,
            task_name: self.task_name,
            record_identifier: self.record_identifier,
            properties: properties.into_iter().collect::<HashMap<_, _>>(),
            retry_count: self.retry_count,
            status,
            last_update_time: self.last_update_time,
        })
    }
}

#[derive(Clone)]
pub struct PgEnvelopeStore {
    pool: PgPool,
}

impl PgEnvelopeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnvelopeStore for PgEnvelopeStore {
    #[tracing::instrument(skip(self))]
    async fn load(&self, correlation_id: &str) -> Result<Option<MessageEnvelope>> {
        let row: Option<EnvelopeRow> = sqlx::query_as::<Postgres, EnvelopeRow>(
            r#"
            SELECT
                id,
                record_identifier,
                task_name,
                broker_message_id,
                retry_count,
                status,
                last_update_time
            FROM message_envelopes
            WHERE broker_message_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch message envelope")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let properties: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT name, value
            FROM message_envelope_properties
            WHERE envelope_id = $1
            "#,
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch message envelope properties")?;

        row.into_envelope(properties).map(Some)
    }

    #[tracing::instrument(skip(self, envelope), fields(task_name = %envelope.task_name, id = ?envelope.id))]
    async fn save(&self, envelope: &MessageEnvelope) -> Result<MessageEnvelope> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for message envelope")?;

        let status = envelope.status.map(|s| s.to_string());

        let id = match envelope.id {
            None => sqlx::query_scalar::<Postgres, i64>(
                r#"
                INSERT INTO message_envelopes (
                    record_identifier, task_name, broker_message_id, retry_count,
                    status, last_update_time
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                "#,
            )
            .bind(&envelope.record_identifier)
            .bind(&envelope.task_name)
            .bind(&envelope.correlation_id)
            .bind(envelope.retry_count)
            .bind(&status)
            .bind(envelope.last_update_time)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert message envelope")?,
            Some(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE message_envelopes
                    SET record_identifier = $1,
                        task_name = $2,
                        broker_message_id = $3,
                        retry_count = $4,
                        status = $5,
                        last_update_time = $6
                    WHERE id = $7
                    "#,
                )
                .bind(&envelope.record_identifier)
                .bind(&envelope.task_name)
                .bind(&envelope.correlation_id)
                .bind(envelope.retry_count)
                .bind(&status)
                .bind(envelope.last_update_time)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to update message envelope")?;

                if result.rows_affected() == 0 {
                    anyhow::bail!("Message envelope {} not found", id);
                }

                sqlx::query("DELETE FROM message_envelope_properties WHERE envelope_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to clear message envelope properties")?;
                id
            }
        };

        for (name, value) in &envelope.properties {
            sqlx::query(
                r#"
                INSERT INTO message_envelope_properties (envelope_id, name, value)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .context("Failed to insert message envelope property")?;
        }

        tx.commit()
            .await
            .context("Failed to commit message envelope")?;

        tracing::debug!(
            envelope_id = id,
            correlation_id = ?envelope.correlation_id,
            retry_count = envelope.retry_count,
            "Message envelope saved"
        );

        let mut saved = envelope.clone();
        saved.id = Some(id);
        Ok(saved)
    }
}

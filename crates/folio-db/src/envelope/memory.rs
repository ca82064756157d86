use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use folio_core::MessageEnvelope;

use super::EnvelopeStore;

#[derive(Default)]
struct Rows {
    next_id: i64,
    envelopes: BTreeMap<i64, MessageEnvelope>,
}

/// Envelope store kept in process memory.
///
/// Used when no database is configured and throughout the test suite.
#[derive(Default)]
pub struct InMemoryEnvelopeStore {
    rows: RwLock<Rows>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<MessageEnvelope> {
        self.rows.read().await.envelopes.get(&id).cloned()
    }

    /// Every stored envelope, ordered by id.
    pub async fn all(&self) -> Vec<MessageEnvelope> {
        self.rows.read().await.envelopes.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.envelopes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryEnvelopeStore {
    async fn load(&self, correlation_id: &str) -> Result<Option<MessageEnvelope>> {
        let rows = self.rows.read().await;
        Ok(rows
            .envelopes
            .values()
            .rev()
            .find(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn save(&self, envelope: &MessageEnvelope) -> Result<MessageEnvelope> {
        let mut rows = self.rows.write().await;
        let mut saved = envelope.clone();

        match envelope.id {
            Some(id) => {
                if !rows.envelopes.contains_key(&id) {
                    anyhow::bail!("Message envelope {} not found", id);
                }
                rows.envelopes.insert(id, saved.clone());
            }
            None => {
                rows.next_id += 1;
                let id = rows.next_id;
                saved.id = Some(id);
                rows.envelopes.insert(id, saved.clone());
            }
        }

        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::TaskStatus;

    fn envelope(correlation_id: &str) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new("reindex").with_property("scope", "full");
        envelope.correlation_id = Some(correlation_id.to_string());
        envelope
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_load_finds_it() {
        let store = InMemoryEnvelopeStore::new();
        let saved = store.save(&envelope("ID:a")).await.unwrap();
        assert_eq!(saved.id, Some(1));

        let loaded = store.load("ID:a").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(store.load("ID:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_single_row() {
        let store = InMemoryEnvelopeStore::new();
        let mut saved = store.save(&envelope("ID:a")).await.unwrap();
        saved.retry_count = 1;
        saved.record_outcome(TaskStatus::Error);
        store.save(&saved).await.unwrap();

        assert_eq!(store.len().await, 1);
        let loaded = store.get(1).await.unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.status, Some(TaskStatus::Error));
    }

    #[tokio::test]
    async fn test_update_of_missing_row_fails() {
        let store = InMemoryEnvelopeStore::new();
        let mut orphan = envelope("ID:a");
        orphan.id = Some(99);
        assert!(store.save(&orphan).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_load_returns_most_recent_row() {
        let store = InMemoryEnvelopeStore::new();
        store.save(&envelope("ID:a")).await.unwrap();
        let newer = store.save(&envelope("ID:a")).await.unwrap();
        assert_eq!(store.load("ID:a").await.unwrap().unwrap().id, newer.id);
    }
}

//! Storage port used by persistence, plus an in-memory implementation.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::record::Row;

/// Insert-or-replace of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    /// Storage model, e.g. "service_metric_hour".
    pub model: String,
    /// Row id within the model: the record's composite key.
    pub id: String,
    pub row: Row,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Previously persisted row for `id`, if any.
    async fn read_existing(&self, model: &str, id: &str) -> Result<Option<Row>>;

    async fn batch_upsert(&self, requests: Vec<UpsertRequest>) -> Result<()>;
}

/// Storage kept in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    rows: DashMap<(String, String), Row>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str, id: &str) -> Option<Row> {
        self.rows
            .get(&(model.to_string(), id.to_string()))
            .map(|row| row.value().clone())
    }

    /// Ids stored under `model`, sorted.
    pub fn ids(&self, model: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == model)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_existing(&self, model: &str, id: &str) -> Result<Option<Row>> {
        Ok(self.get(model, id))
    }

    async fn batch_upsert(&self, requests: Vec<UpsertRequest>) -> Result<()> {
        for request in requests {
            self.rows.insert((request.model, request.id), request.row);
        }
        Ok(())
    }
}

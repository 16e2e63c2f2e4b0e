//! Persistence: double-buffered per-type caches fed by the last node of each
//! metric graph, flushed to storage by a periodic timer.

pub mod buffer;
pub mod queue;
pub mod timer;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::record::{from_row, merge_record, model_name, to_row, Record, Row};
use crate::storage::{Storage, UpsertRequest};
use crate::worker::{Next, Worker};

pub use buffer::DoubleBuffer;
pub use queue::BatchQueue;
pub use timer::{FlushReport, PersistenceTimer};

/// One upsert ready to be written, together with the in-memory delta it was
/// built from so the delta can be requeued if the write fails.
#[derive(Debug, Clone)]
pub struct PreparedUpsert {
    pub request: UpsertRequest,
    pub delta: Row,
}

/// Result of preparing one cache for a flush cycle.
#[derive(Debug, Default)]
pub struct PrepareOutcome {
    pub upserts: Vec<PreparedUpsert>,
    /// Deltas that were not prepared because reading persisted state failed.
    pub unread: Vec<Row>,
    /// Records without a persistable model, discarded.
    pub invalid: usize,
}

/// A cache the persistence timer can flush, independent of its record type.
#[async_trait]
pub trait PersistenceFlush: Send + Sync {
    /// Record type name, used as a metrics label.
    fn name(&self) -> &'static str;

    /// Retires the current generation and turns every key into an upsert
    /// merged with what storage already holds. Stops at the first read
    /// failure; the rest of the generation is returned as `unread`.
    async fn prepare(&self, storage: &dyn Storage, drain_poll: Duration) -> PrepareOutcome;

    /// Merges deltas back into the current generation. Returns how many were
    /// accepted.
    fn requeue(&self, deltas: Vec<Row>) -> usize;

    /// Keys waiting in the current generation.
    fn pending(&self) -> usize;
}

/// Double-buffered cache for one record type.
pub struct PersistenceCache<R> {
    buffer: DoubleBuffer<R>,
}

impl<R: Record> Default for PersistenceCache<R> {
    fn default() -> Self {
        Self {
            buffer: DoubleBuffer::new(),
        }
    }
}

impl<R: Record> PersistenceCache<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, record: R) {
        self.buffer.write(record);
    }

    async fn merge_existing(&self, storage: &dyn Storage, model: &str, id: &str, delta: &R) -> Result<Row> {
        let Some(existing) = storage
            .read_existing(model, id)
            .await
            .with_context(|| format!("reading {model}/{id}"))?
        else {
            return Ok(to_row(delta));
        };

        let mut merged: R = from_row(&existing).with_context(|| format!("decoding {model}/{id}"))?;
        merge_record(&mut merged, delta);
        Ok(to_row(&merged))
    }
}

#[async_trait]
impl<R: Record> PersistenceFlush for PersistenceCache<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    async fn prepare(&self, storage: &dyn Storage, drain_poll: Duration) -> PrepareOutcome {
        let retired = self.buffer.switch(drain_poll).await;

        let mut entries: Vec<_> = retired.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut outcome = PrepareOutcome::default();
        let mut entries = entries.into_iter();
        while let Some((key, delta)) = entries.next() {
            let model = match model_name(&delta) {
                Ok(model) => model,
                Err(e) => {
                    warn!(record = R::NAME, key = %key, error = %e, "record has no storage model, discarded");
                    outcome.invalid += 1;
                    continue;
                }
            };
            let id = key.to_string();

            match self.merge_existing(storage, &model, &id, &delta).await {
                Ok(row) => outcome.upserts.push(PreparedUpsert {
                    request: UpsertRequest { model, id, row },
                    delta: to_row(&delta),
                }),
                Err(e) => {
                    let remaining = entries.len();
                    warn!(
                        record = R::NAME,
                        key = %key,
                        remaining,
                        error = %format!("{e:#}"),
                        "persisted state read failed, skipping rest of generation",
                    );
                    outcome.unread.push(to_row(&delta));
                    outcome.unread.extend(entries.by_ref().map(|(_, r)| to_row(&r)));
                    break;
                }
            }
        }

        outcome
    }

    fn requeue(&self, deltas: Vec<Row>) -> usize {
        let mut accepted = 0;
        for row in deltas {
            match from_row::<R>(&row) {
                Ok(record) => {
                    self.buffer.write(record);
                    accepted += 1;
                }
                Err(e) => warn!(record = R::NAME, error = %e, "cannot requeue delta"),
            }
        }
        accepted
    }

    fn pending(&self) -> usize {
        self.buffer.pending()
    }
}

/// Final node of a metric graph: merges records into its cache.
pub struct PersistenceWorker<R> {
    id: u32,
    cache: Arc<PersistenceCache<R>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> PersistenceWorker<R> {
    pub fn new(id: u32, cache: Arc<PersistenceCache<R>>) -> Self {
        Self {
            id,
            cache,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Record> Worker for PersistenceWorker<R> {
    type Input = R;
    type Output = ();

    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn on_work(&mut self, record: R, _next: &Next<()>) -> Result<()> {
        self.cache.write(record);
        Ok(())
    }
}

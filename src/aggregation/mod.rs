pub mod downsampling;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use prometheus::Counter;

use crate::export::health::HealthMetrics;
use crate::record::{apply_formulas, merge_record, CompositeKey, Record};
use crate::worker::{Next, StreamData, Worker};

pub use downsampling::DownsamplingWorker;

/// Converts one raw input into its canonical metric record.
pub trait Transform: Send + Sync + 'static {
    type Input: StreamData;
    type Output: Record;

    fn transform(&self, input: Self::Input) -> Result<Self::Output>;
}

/// Open-window records keyed by composite key.
#[derive(Debug)]
pub struct Accumulator<R> {
    entries: HashMap<CompositeKey, R>,
}

impl<R> Default for Accumulator<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<R: Record> Accumulator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record for a new key or merges it into the existing one.
    pub fn accept(&mut self, mut record: R) {
        match self.entries.entry(record.composite_key()) {
            Entry::Occupied(mut existing) => merge_record(existing.get_mut(), &record),
            Entry::Vacant(slot) => {
                apply_formulas(&mut record);
                slot.insert(record);
            }
        }
    }

    pub fn get(&self, key: &CompositeKey) -> Option<&R> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes every record, leaving the map empty for the next window.
    pub fn drain(&mut self) -> Vec<R> {
        self.entries.drain().map(|(_, record)| record).collect()
    }
}

/// Pushes every record to `next`. All records are attempted even when some
/// are refused.
pub(crate) async fn emit<R: Record>(records: Vec<R>, next: &Next<R>) -> Result<()> {
    let total = records.len();
    let mut failed = 0usize;
    let mut last_error = None;

    for record in records {
        if let Err(e) = next.execute(record).await {
            failed += 1;
            last_error = Some(e);
        }
    }

    match last_error {
        Some(e) => bail!("{failed} of {total} records not delivered: {e:#}"),
        None => Ok(()),
    }
}

/// First-stage aggregation: transforms raw inputs and merges them per key
/// until the end of the batch.
pub struct AggregationWorker<T: Transform> {
    id: u32,
    transform: T,
    accumulator: Accumulator<T::Output>,
    emitted: Option<Counter>,
}

impl<T: Transform> AggregationWorker<T> {
    pub fn new(id: u32, transform: T) -> Self {
        Self {
            id,
            transform,
            accumulator: Accumulator::new(),
            emitted: None,
        }
    }

    pub fn with_health(mut self, health: Option<&Arc<HealthMetrics>>) -> Self {
        self.emitted = health.map(|h| {
            h.aggregation_records_emitted
                .with_label_values(&[T::Output::NAME])
        });
        self
    }

    /// Keys accumulated in the open window.
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }
}

#[async_trait]
impl<T: Transform> Worker for AggregationWorker<T> {
    type Input = T::Input;
    type Output = T::Output;

    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        "aggregation"
    }

    async fn on_work(&mut self, message: T::Input, _next: &Next<T::Output>) -> Result<()> {
        let record = self.transform.transform(message)?;
        self.accumulator.accept(record);
        Ok(())
    }

    async fn on_end_of_batch(&mut self, next: &Next<T::Output>) -> Result<()> {
        if self.accumulator.is_empty() {
            return Ok(());
        }

        let records = self.accumulator.drain();
        if let Some(counter) = &self.emitted {
            counter.inc_by(records.len() as f64);
        }

        emit(records, next).await
    }
}

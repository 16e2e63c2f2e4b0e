use anyhow::Result;
use async_trait::async_trait;

use crate::config::DownsamplingLevel;
use crate::record::{Downsampling, Record};
use crate::worker::{Next, Worker};

use super::{emit, Accumulator};

#[derive(Debug)]
struct TierAccumulator<R> {
    granularity: Downsampling,
    tick_target: u32,
    ticks_elapsed: u32,
    records: Accumulator<R>,
}

/// Second-stage aggregation. Re-merges records at every configured
/// granularity, each with its own map and flush cadence.
pub struct DownsamplingWorker<R> {
    id: u32,
    tiers: Vec<TierAccumulator<R>>,
}

impl<R: Record> DownsamplingWorker<R> {
    pub fn new(id: u32, levels: &[DownsamplingLevel]) -> Self {
        let mut tiers: Vec<TierAccumulator<R>> = levels
            .iter()
            .map(|level| TierAccumulator {
                granularity: level.granularity,
                tick_target: level.flush_every.max(1),
                ticks_elapsed: 0,
                records: Accumulator::new(),
            })
            .collect();
        tiers.sort_by_key(|tier| tier.granularity);

        Self { id, tiers }
    }

    /// Keys pending at `granularity`.
    pub fn pending(&self, granularity: Downsampling) -> usize {
        self.tiers
            .iter()
            .find(|tier| tier.granularity == granularity)
            .map_or(0, |tier| tier.records.len())
    }

    fn drain_due(&mut self, force: bool) -> Vec<R> {
        let mut due = Vec::new();
        for tier in &mut self.tiers {
            tier.ticks_elapsed = tier.ticks_elapsed.saturating_add(1);
            if force || tier.ticks_elapsed >= tier.tick_target {
                due.extend(tier.records.drain());
                tier.ticks_elapsed = 0;
            }
        }
        due
    }
}

#[async_trait]
impl<R: Record> Worker for DownsamplingWorker<R> {
    type Input = R;
    type Output = R;

    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        "downsampling"
    }

    async fn on_work(&mut self, record: R, _next: &Next<R>) -> Result<()> {
        let bucket = record.time_bucket();
        let source = Downsampling::of_bucket(bucket)?;

        for tier in &mut self.tiers {
            // A record can only be rolled up, never refined.
            if tier.granularity < source {
                continue;
            }
            let mut rolled = record.clone();
            rolled.set_time_bucket(tier.granularity.rollup(bucket)?);
            tier.records.accept(rolled);
        }

        Ok(())
    }

    async fn on_end_of_batch(&mut self, next: &Next<R>) -> Result<()> {
        let due = self.drain_due(false);
        if due.is_empty() {
            return Ok(());
        }
        emit(due, next).await
    }

    async fn on_shutdown(&mut self, next: &Next<R>) -> Result<()> {
        let due = self.drain_due(true);
        if due.is_empty() {
            return Ok(());
        }
        emit(due, next).await
    }
}

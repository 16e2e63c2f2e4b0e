use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;
use crate::export::health::HealthMetrics;
use crate::record::Row;
use crate::storage::{Storage, UpsertRequest};

use super::queue::BatchQueue;
use super::{PersistenceFlush, PreparedUpsert};

/// Totals of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Upserts built from retired generations.
    pub prepared: usize,
    /// Rows written to storage.
    pub upserted: usize,
    /// Keys whose read or write failed.
    pub failed: usize,
    /// Failed keys merged back into their cache.
    pub requeued: usize,
    /// Failed or unpersistable keys discarded.
    pub dropped: usize,
}

struct Job {
    owner: usize,
    upsert: PreparedUpsert,
}

#[derive(Default)]
struct ConsumerTally {
    upserted: usize,
    failed: Vec<(usize, Row)>,
}

/// Periodically flushes every registered cache to storage.
///
/// Each cycle retires the caches' current generations, merges them with
/// persisted state and writes the result in batches of at most
/// `max_batch_size` rows using `sync_workers` concurrent writers. The first
/// failed write ends the cycle; what was not written is requeued or dropped
/// according to `requeue_failed`.
pub struct PersistenceTimer {
    cfg: PersistenceConfig,
    storage: Arc<dyn Storage>,
    caches: RwLock<Vec<Arc<dyn PersistenceFlush>>>,
    health: Option<Arc<HealthMetrics>>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PersistenceTimer {
    pub fn new(cfg: PersistenceConfig, storage: Arc<dyn Storage>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            storage,
            caches: RwLock::new(Vec::new()),
            health,
            running: Mutex::new(None),
        }
    }

    pub fn register(&self, cache: Arc<dyn PersistenceFlush>) {
        self.caches.write().push(cache);
    }

    pub fn registered(&self) -> usize {
        self.caches.read().len()
    }

    /// Starts the periodic loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let timer = Arc::clone(self);
        let handle = tokio::spawn(timer.run(cancel.clone()));
        *running = Some((cancel, handle));
    }

    /// Stops the loop after any in-progress cycle and runs a final flush.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "persistence timer task failed");
            }
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            period = ?self.cfg.period,
            initial_delay = ?self.cfg.initial_delay,
            caches = self.registered(),
            "persistence timer started",
        );

        let started = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.cfg.initial_delay) => true,
        };

        if started {
            let mut ticker = tokio::time::interval(self.cfg.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush_once().await;
                    }
                }
            }
        }

        let report = self.flush_once().await;
        info!(
            upserted = report.upserted,
            failed = report.failed,
            "persistence timer stopped after final flush",
        );
    }

    /// Runs one complete flush cycle over every registered cache.
    pub async fn flush_once(&self) -> FlushReport {
        let started = Instant::now();
        let caches = self.caches.read().clone();
        let mut report = FlushReport::default();

        let queue = Arc::new(BatchQueue::<Job>::new(self.cfg.max_batch_size));
        let aborted = Arc::new(AtomicBool::new(false));

        let consumers: Vec<_> = (0..self.cfg.sync_workers.max(1))
            .map(|_| {
                tokio::spawn(consume(
                    Arc::clone(&queue),
                    Arc::clone(&self.storage),
                    Arc::clone(&aborted),
                    self.health.clone(),
                ))
            })
            .collect();

        let mut failed: Vec<(usize, Row)> = Vec::new();
        for (owner, cache) in caches.iter().enumerate() {
            // Caches not yet switched keep their data for the next cycle.
            if aborted.load(Ordering::SeqCst) {
                debug!(cache = cache.name(), "cycle aborted, cache left for next cycle");
                continue;
            }

            let prepare_started = Instant::now();
            let outcome = cache.prepare(self.storage.as_ref(), self.cfg.drain_poll).await;
            if let Some(health) = &self.health {
                health
                    .persistence_prepare_duration
                    .with_label_values(&[cache.name()])
                    .observe(prepare_started.elapsed().as_secs_f64());
            }

            report.prepared += outcome.upserts.len();
            report.dropped += outcome.invalid;

            if !outcome.unread.is_empty() {
                if let Some(health) = &self.health {
                    health.persistence_errors.with_label_values(&["read"]).inc();
                }
                aborted.store(true, Ordering::SeqCst);
                failed.extend(outcome.unread.into_iter().map(|row| (owner, row)));
            }

            queue.offer(
                outcome
                    .upserts
                    .into_iter()
                    .map(|upsert| Job { owner, upsert })
                    .collect(),
            );
        }
        queue.no_further_appending();

        for consumer in consumers {
            match consumer.await {
                Ok(tally) => {
                    report.upserted += tally.upserted;
                    failed.extend(tally.failed);
                }
                Err(e) => error!(error = %e, "persistence writer task failed"),
            }
        }

        report.failed = failed.len();
        if !failed.is_empty() {
            self.settle_failures(&caches, failed, &mut report);
        }

        let elapsed = started.elapsed();
        if let Some(health) = &self.health {
            health.persistence_flush_duration.observe(elapsed.as_secs_f64());
        }

        if report.prepared > 0 || report.failed > 0 {
            info!(
                prepared = report.prepared,
                upserted = report.upserted,
                failed = report.failed,
                requeued = report.requeued,
                dropped = report.dropped,
                duration_ms = elapsed.as_millis() as u64,
                "persistence flush",
            );
        }

        report
    }

    fn settle_failures(
        &self,
        caches: &[Arc<dyn PersistenceFlush>],
        failed: Vec<(usize, Row)>,
        report: &mut FlushReport,
    ) {
        let mut by_owner: BTreeMap<usize, Vec<Row>> = BTreeMap::new();
        for (owner, row) in failed {
            by_owner.entry(owner).or_default().push(row);
        }

        for (owner, rows) in by_owner {
            let Some(cache) = caches.get(owner) else {
                continue;
            };
            let count = rows.len();

            if self.cfg.requeue_failed {
                let accepted = cache.requeue(rows);
                report.requeued += accepted;
                report.dropped += count - accepted;
                if let Some(health) = &self.health {
                    health.persistence_requeued.inc_by(accepted as f64);
                    health.persistence_dropped.inc_by((count - accepted) as f64);
                }
            } else {
                warn!(cache = cache.name(), keys = count, "dropping unpersisted keys");
                report.dropped += count;
                if let Some(health) = &self.health {
                    health.persistence_dropped.inc_by(count as f64);
                }
            }
        }
    }
}

/// Drains the batch queue into storage until it is closed. After the first
/// failed write, the remaining batches are handed back unwritten.
async fn consume(
    queue: Arc<BatchQueue<Job>>,
    storage: Arc<dyn Storage>,
    aborted: Arc<AtomicBool>,
    health: Option<Arc<HealthMetrics>>,
) -> ConsumerTally {
    let mut tally = ConsumerTally::default();

    loop {
        let batch = queue.poll().await;
        if batch.is_empty() {
            return tally;
        }

        let mut requests: Vec<UpsertRequest> = Vec::with_capacity(batch.len());
        let mut deltas = Vec::with_capacity(batch.len());
        for job in batch {
            requests.push(job.upsert.request);
            deltas.push((job.owner, job.upsert.delta));
        }

        if aborted.load(Ordering::SeqCst) {
            tally.failed.extend(deltas);
            continue;
        }

        let rows = requests.len();
        let started = Instant::now();
        match storage.batch_upsert(requests).await {
            Ok(()) => {
                tally.upserted += rows;
                if let Some(health) = &health {
                    health.persistence_upsert_duration.observe(started.elapsed().as_secs_f64());
                    health.persistence_batch_size.observe(rows as f64);
                }
            }
            Err(e) => {
                aborted.store(true, Ordering::SeqCst);
                warn!(
                    rows,
                    remaining = queue.len(),
                    error = %format!("{e:#}"),
                    "batch upsert failed, ending flush cycle",
                );
                if let Some(health) = &health {
                    health.persistence_errors.with_label_values(&["upsert"]).inc();
                }
                tally.failed.extend(deltas);
            }
        }
    }
}

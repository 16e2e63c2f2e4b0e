use std::any::{type_name, Any};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use prometheus::Counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::StageConfig;
use crate::export::health::HealthMetrics;

use super::mailbox::{self, Envelope};
use super::{Next, Worker, WorkerRef};

/// Per-worker counters resolved once at spawn time.
#[derive(Clone)]
struct WorkerCounters {
    processed: Counter,
    failed: Counter,
    flushes: Counter,
}

impl WorkerCounters {
    fn new(health: &HealthMetrics, graph: &str, worker: &str) -> Self {
        let labels = [graph, worker];
        Self {
            processed: health.worker_messages_processed.with_label_values(&labels),
            failed: health.worker_messages_failed.with_label_values(&labels),
            flushes: health.worker_end_of_batch.with_label_values(&labels),
        }
    }
}

/// Fixed-size pool shared by every worker of one pipeline stage.
///
/// Each worker runs as its own task, but only `workers` of them hold a permit
/// and execute at any instant. A worker holds its permit while it drains a
/// burst of messages, so its state is only ever touched by one task.
pub struct WorkerPool {
    stage: &'static str,
    cfg: StageConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<JoinSet<()>>,
    health: Option<Arc<HealthMetrics>>,
}

impl WorkerPool {
    pub fn new(stage: &'static str, cfg: StageConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.workers.max(1)));

        Self {
            stage,
            cfg,
            permits,
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
            health,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Spawns `worker` of graph `graph_id` onto this pool and returns the
    /// handle feeding its mailbox. Must be called from within a tokio runtime.
    pub fn spawn<W: Worker>(
        &self,
        graph_id: u32,
        worker: W,
        next: Arc<Next<W::Output>>,
    ) -> WorkerRef<W::Input> {
        let (mailbox, rx) = mailbox::channel(&self.cfg.mailbox);
        let graph = graph_id.to_string();
        let counters = self
            .health
            .as_deref()
            .map(|h| WorkerCounters::new(h, &graph, worker.name()));
        let rejected = self.health.as_deref().map(|h| {
            h.worker_mailbox_rejected
                .with_label_values(&[graph.as_str(), worker.name()])
        });

        let handle = WorkerRef::new(worker.id(), worker.name(), mailbox, rejected);

        debug!(
            stage = self.stage,
            graph_id,
            worker = worker.name(),
            worker_id = worker.id(),
            capacity = self.cfg.mailbox.capacity,
            "spawning worker",
        );

        let run = WorkerLoop {
            worker,
            rx,
            next,
            permits: Arc::clone(&self.permits),
            batch_size: self.cfg.batch_size.max(1),
            flush_interval: self.cfg.flush_interval,
            cancel: self.cancel.child_token(),
            counters,
        };
        self.tasks.lock().spawn(run.run());

        handle
    }

    /// Stops every worker of this stage. Each worker drains what is already
    /// queued and flushes before exiting.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(stage = self.stage, error = %e, "worker task failed");
            }
        }

        info!(stage = self.stage, workers = count, "worker pool stopped");
    }
}

struct WorkerLoop<W: Worker> {
    worker: W,
    rx: mpsc::Receiver<Envelope<W::Input>>,
    next: Arc<Next<W::Output>>,
    permits: Arc<Semaphore>,
    batch_size: usize,
    flush_interval: std::time::Duration,
    cancel: CancellationToken,
    counters: Option<WorkerCounters>,
}

impl<W: Worker> WorkerLoop<W> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Consume the immediate first tick.
        ticker.tick().await;

        let permits = Arc::clone(&self.permits);
        let mut dirty = false;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick(), if dirty => {
                    let Ok(_permit) = permits.acquire().await else {
                        break;
                    };
                    self.end_of_batch().await;
                    dirty = false;
                }

                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    let Ok(_permit) = permits.acquire().await else {
                        break;
                    };

                    // Drain a burst; flush as soon as the queue runs dry.
                    let mut pending = Some(envelope);
                    let mut handled = 0usize;
                    while let Some(envelope) = pending.take() {
                        match envelope {
                            Envelope::Message(message) => {
                                self.handle(message).await;
                                dirty = true;
                            }
                            Envelope::EndOfBatch => {
                                self.end_of_batch().await;
                                dirty = false;
                            }
                        }

                        handled += 1;
                        if handled >= self.batch_size {
                            break;
                        }

                        match self.rx.try_recv() {
                            Ok(envelope) => pending = Some(envelope),
                            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                                if dirty {
                                    self.end_of_batch().await;
                                    dirty = false;
                                }
                            }
                        }
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            if let Envelope::Message(message) = envelope {
                self.handle(message).await;
            }
        }

        if let Err(e) = guarded(self.worker.on_shutdown(&self.next)).await {
            error!(
                worker_id = self.worker.id(),
                worker = self.worker.name(),
                error = %e,
                "worker shutdown flush failed",
            );
        }
        debug!(worker = self.worker.name(), "worker stopped");
    }

    async fn handle(&mut self, message: W::Input) {
        match guarded(self.worker.on_work(message, &self.next)).await {
            Ok(()) => {
                if let Some(c) = &self.counters {
                    c.processed.inc();
                }
            }
            Err(e) => {
                if let Some(c) = &self.counters {
                    c.failed.inc();
                }
                error!(
                    worker_id = self.worker.id(),
                    worker = self.worker.name(),
                    message_type = type_name::<W::Input>(),
                    error = %e,
                    "worker failed to process message",
                );
            }
        }
    }

    async fn end_of_batch(&mut self) {
        if let Some(c) = &self.counters {
            c.flushes.inc();
        }
        if let Err(e) = guarded(self.worker.on_end_of_batch(&self.next)).await {
            error!(
                worker_id = self.worker.id(),
                worker = self.worker.name(),
                error = %e,
                "worker failed to flush batch",
            );
        }
    }
}

/// Runs one worker callback, turning a panic into an error so the loop
/// keeps consuming its mailbox.
async fn guarded(callback: impl Future<Output = Result<()>>) -> Result<()> {
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::worker::mailbox::MailboxConfig;
    use crate::worker::NodeProcessor;

    #[derive(Default)]
    struct Journal {
        messages: Vec<u32>,
        batches: Vec<Vec<u32>>,
        shutdown: bool,
    }

    /// Records messages and flushes them as one batch per end-of-batch.
    struct Recorder {
        journal: Arc<Mutex<Journal>>,
        open: Vec<u32>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl Worker for Recorder {
        type Input = u32;
        type Output = u32;

        fn id(&self) -> u32 {
            1
        }

        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn on_work(&mut self, message: u32, _next: &Next<u32>) -> Result<()> {
            if self.fail_on == Some(message) {
                bail!("poisoned message {message}");
            }
            self.journal.lock().messages.push(message);
            self.open.push(message);
            Ok(())
        }

        async fn on_end_of_batch(&mut self, next: &Next<u32>) -> Result<()> {
            if self.open.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut self.open);
            let total = batch.iter().sum();
            self.journal.lock().batches.push(batch);
            next.execute(total).await
        }

        async fn on_shutdown(&mut self, next: &Next<u32>) -> Result<()> {
            self.journal.lock().shutdown = true;
            self.on_end_of_batch(next).await
        }
    }

    /// Panics on one message and on the first flush after it.
    struct Brittle {
        seen: Arc<Mutex<Vec<u32>>>,
        panic_on: u32,
        armed: bool,
    }

    #[async_trait]
    impl Worker for Brittle {
        type Input = u32;
        type Output = u32;

        fn id(&self) -> u32 {
            2
        }

        fn name(&self) -> &'static str {
            "brittle"
        }

        async fn on_work(&mut self, message: u32, _next: &Next<u32>) -> Result<()> {
            if message == self.panic_on {
                self.armed = true;
                panic!("cannot handle {message}");
            }
            self.seen.lock().push(message);
            Ok(())
        }

        async fn on_end_of_batch(&mut self, _next: &Next<u32>) -> Result<()> {
            if std::mem::take(&mut self.armed) {
                panic!("flush failed after {}", self.panic_on);
            }
            Ok(())
        }
    }

    struct Sink(Arc<Mutex<Vec<u32>>>);

    #[async_trait]
    impl NodeProcessor<u32> for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        async fn process(&self, message: u32) -> Result<()> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    fn stage(batch_size: usize, flush_interval: Duration) -> StageConfig {
        StageConfig {
            workers: 1,
            batch_size,
            flush_interval,
            mailbox: MailboxConfig {
                capacity: 64,
                ..Default::default()
            },
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_failed_message_does_not_stop_the_loop() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let pool = WorkerPool::new("test", stage(16, Duration::from_secs(60)), None);
        let worker = pool.spawn(
            1,
            Recorder {
                journal: Arc::clone(&journal),
                open: Vec::new(),
                fail_on: Some(2),
            },
            Arc::new(Next::new()),
        );

        for n in 1..=4 {
            worker.process(n).await.expect("enqueue");
        }
        wait_for(|| journal.lock().messages.len() == 3).await;

        assert_eq!(journal.lock().messages, vec![1, 3, 4]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_worker_keeps_consuming() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let pool = WorkerPool::new(
            "test",
            stage(16, Duration::from_secs(60)),
            Some(Arc::clone(&health)),
        );
        let worker = pool.spawn(
            1,
            Brittle {
                seen: Arc::clone(&seen),
                panic_on: 2,
                armed: false,
            },
            Arc::new(Next::new()),
        );

        for n in 1..=4 {
            worker.process(n).await.expect("enqueue");
        }
        wait_for(|| seen.lock().len() == 3).await;
        worker.process(5).await.expect("mailbox still open");
        wait_for(|| seen.lock().len() == 4).await;

        assert_eq!(*seen.lock(), vec![1, 3, 4, 5]);
        let failed = health
            .worker_messages_failed
            .with_label_values(&["1", "brittle"])
            .get();
        assert_eq!(failed, 1.0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_counters_are_labelled_per_graph() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let pool = WorkerPool::new(
            "test",
            stage(16, Duration::from_secs(60)),
            Some(Arc::clone(&health)),
        );
        let recorder = || Recorder {
            journal: Arc::new(Mutex::new(Journal::default())),
            open: Vec::new(),
            fail_on: None,
        };
        let first = pool.spawn(301, recorder(), Arc::new(Next::new()));
        let second = pool.spawn(302, recorder(), Arc::new(Next::new()));

        first.process(1).await.expect("enqueue");
        for n in 0..3 {
            second.process(n).await.expect("enqueue");
        }
        let processed = |graph: &str| {
            health
                .worker_messages_processed
                .with_label_values(&[graph, "recorder"])
                .get()
        };
        wait_for(|| processed("301") == 1.0 && processed("302") == 3.0).await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_end_of_batch_flushes() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let out = Arc::new(Mutex::new(Vec::new()));
        let next = Arc::new(Next::new());
        next.add(Arc::new(Sink(Arc::clone(&out))));

        let pool = WorkerPool::new("test", stage(16, Duration::from_secs(60)), None);
        let worker = pool.spawn(
            1,
            Recorder {
                journal: Arc::clone(&journal),
                open: Vec::new(),
                fail_on: None,
            },
            next,
        );

        worker.process(3).await.expect("enqueue");
        worker.process(5).await.expect("enqueue");
        worker.end_of_batch().expect("marker");
        wait_for(|| !out.lock().is_empty()).await;

        let flushed: u32 = out.lock().iter().sum();
        assert_eq!(flushed, 8);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_messages_are_processed_in_fifo_order() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let pool = WorkerPool::new("test", stage(4, Duration::from_secs(60)), None);
        let worker = pool.spawn(
            1,
            Recorder {
                journal: Arc::clone(&journal),
                open: Vec::new(),
                fail_on: None,
            },
            Arc::new(Next::new()),
        );

        for n in 0..50 {
            worker.process(n).await.expect("enqueue");
        }
        wait_for(|| journal.lock().messages.len() == 50).await;

        let expected: Vec<u32> = (0..50).collect();
        assert_eq!(journal.lock().messages, expected);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_flushes() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let out = Arc::new(Mutex::new(Vec::new()));
        let next = Arc::new(Next::new());
        next.add(Arc::new(Sink(Arc::clone(&out))));

        let pool = WorkerPool::new("test", stage(16, Duration::from_secs(60)), None);
        let worker = pool.spawn(
            1,
            Recorder {
                journal: Arc::clone(&journal),
                open: Vec::new(),
                fail_on: None,
            },
            next,
        );
        for n in 1..=3 {
            worker.process(n).await.expect("enqueue");
        }

        pool.shutdown().await;

        let journal = journal.lock();
        assert!(journal.shutdown);
        assert_eq!(journal.messages, vec![1, 2, 3]);
        assert_eq!(out.lock().iter().sum::<u32>(), 6);
    }

    #[tokio::test]
    async fn test_every_message_lands_in_exactly_one_batch() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let pool = WorkerPool::new("test", stage(8, Duration::from_millis(10)), None);
        let worker = pool.spawn(
            1,
            Recorder {
                journal: Arc::clone(&journal),
                open: Vec::new(),
                fail_on: None,
            },
            Arc::new(Next::new()),
        );

        for n in 0..100 {
            worker.process(n).await.expect("enqueue");
        }
        wait_for(|| {
            journal
                .lock()
                .batches
                .iter()
                .map(Vec::len)
                .sum::<usize>()
                == 100
        })
        .await;

        let mut flushed: Vec<u32> = journal.lock().batches.iter().flatten().copied().collect();
        flushed.sort_unstable();
        assert_eq!(flushed, (0..100).collect::<Vec<_>>());
        pool.shutdown().await;
    }
}

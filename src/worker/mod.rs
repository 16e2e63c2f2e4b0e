pub mod mailbox;
pub mod pool;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use prometheus::Counter;
use serde::de::DeserializeOwned;
use serde::Serialize;

use mailbox::Mailbox;

pub use pool::WorkerPool;

/// Anything that can travel along a graph edge, including across the cluster.
pub trait StreamData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> StreamData for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Receives messages for one hop of a pipeline: a worker's mailbox, or an
/// adapter forwarding into another graph.
#[async_trait]
pub trait NodeProcessor<T>: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, message: T) -> Result<()>;
}

/// A stateful processing unit drained by exactly one consumer at a time.
#[async_trait]
pub trait Worker: Send + 'static {
    type Input: StreamData;
    type Output: StreamData;

    /// Stable id, unique within the enclosing graph.
    fn id(&self) -> u32;

    fn name(&self) -> &'static str;

    async fn on_work(&mut self, message: Self::Input, next: &Next<Self::Output>) -> Result<()>;

    /// Called on every end-of-batch marker. Accumulating workers flush here.
    async fn on_end_of_batch(&mut self, _next: &Next<Self::Output>) -> Result<()> {
        Ok(())
    }

    /// Called once after the mailbox is drained during shutdown.
    async fn on_shutdown(&mut self, next: &Next<Self::Output>) -> Result<()> {
        self.on_end_of_batch(next).await
    }
}

/// Outgoing edges of a node. Every message is pushed to every successor.
pub struct Next<T> {
    successors: ArcSwap<Vec<Arc<dyn NodeProcessor<T>>>>,
}

impl<T> Default for Next<T> {
    fn default() -> Self {
        Self {
            successors: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl<T: Clone + Send + 'static> Next<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, processor: Arc<dyn NodeProcessor<T>>) {
        self.successors.rcu(|current| {
            let mut successors = Vec::clone(current);
            successors.push(Arc::clone(&processor));
            successors
        });
    }

    pub fn len(&self) -> usize {
        self.successors.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fans `message` out to every successor. Every successor is attempted even
    /// if an earlier one fails.
    pub async fn execute(&self, message: T) -> Result<()> {
        let successors = self.successors.load_full();
        let Some((last, rest)) = successors.split_last() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for successor in rest {
            if let Err(e) = successor.process(message.clone()).await {
                failures.push(format!("{}: {e:#}", successor.name()));
            }
        }
        if let Err(e) = last.process(message).await {
            failures.push(format!("{}: {e:#}", last.name()));
        }

        if !failures.is_empty() {
            bail!(
                "{} of {} successors rejected message: {}",
                failures.len(),
                successors.len(),
                failures.join("; ")
            );
        }

        Ok(())
    }
}

/// Handle to a spawned worker: pushing into it enqueues into its mailbox.
pub struct WorkerRef<T> {
    id: u32,
    name: &'static str,
    mailbox: Mailbox<T>,
    rejected: Option<Counter>,
}

impl<T: Send> WorkerRef<T> {
    pub(crate) fn new(
        id: u32,
        name: &'static str,
        mailbox: Mailbox<T>,
        rejected: Option<Counter>,
    ) -> Self {
        Self {
            id,
            name,
            mailbox,
            rejected,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mailbox(&self) -> &Mailbox<T> {
        &self.mailbox
    }

    /// Asks the worker to flush whatever it has accumulated.
    pub fn end_of_batch(&self) -> Result<()> {
        self.mailbox
            .end_of_batch()
            .with_context(|| format!("signalling end of batch to {}", self.name))
    }
}

#[async_trait]
impl<T: Send + 'static> NodeProcessor<T> for WorkerRef<T> {
    fn name(&self) -> &str {
        self.name
    }

    async fn process(&self, message: T) -> Result<()> {
        if let Err(e) = self.mailbox.offer(message).await {
            if let Some(rejected) = &self.rejected {
                rejected.inc();
            }
            return Err(e).with_context(|| format!("enqueueing into {} ({})", self.name, self.id));
        }
        Ok(())
    }
}

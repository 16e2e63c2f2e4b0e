pub mod membership;
pub mod selector;
pub mod server;
pub mod transport;

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use prometheus::Counter;
use tracing::warn;

use crate::export::health::HealthMetrics;
use crate::graph::codec;
use crate::record::Record;
use crate::worker::{Next, Worker};

pub use membership::{ClusterMembership, PeerAddress, StaticMembership};
pub use selector::Selector;
pub use server::RemoteServer;
pub use transport::{HttpTransport, LoopbackTransport, RemoteTransport};

/// Cluster services shared by every remote worker of a node.
#[derive(Clone)]
pub struct ClusterContext {
    pub membership: Arc<dyn ClusterMembership>,
    pub transport: Arc<dyn RemoteTransport>,
}

struct DispatchCounters {
    local: Counter,
    remote: Counter,
    errors: Counter,
}

/// Routes each record to the one peer owning its key. Records owned by the
/// local node go straight to this node's successor; others are encoded and
/// sent to node `target_node` of graph `graph_id` on the owning peer.
pub struct RemoteWorker<R> {
    id: u32,
    graph_id: u32,
    target_node: u32,
    selector: Selector,
    cluster: ClusterContext,
    counters: Option<DispatchCounters>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> RemoteWorker<R> {
    pub fn new(id: u32, graph_id: u32, target_node: u32, selector: Selector, cluster: ClusterContext) -> Self {
        Self {
            id,
            graph_id,
            target_node,
            selector,
            cluster,
            counters: None,
            _record: PhantomData,
        }
    }

    pub fn with_health(mut self, health: Option<&Arc<HealthMetrics>>) -> Self {
        self.counters = health.map(|h| DispatchCounters {
            local: h.remote_dispatches.with_label_values(&["local"]),
            remote: h.remote_dispatches.with_label_values(&["remote"]),
            errors: h.remote_send_errors.clone(),
        });
        self
    }
}

#[async_trait]
impl<R: Record> Worker for RemoteWorker<R> {
    type Input = R;
    type Output = R;

    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        "remote"
    }

    async fn on_work(&mut self, record: R, next: &Next<R>) -> Result<()> {
        let peers = self.cluster.membership.current_peers();
        let key = record.composite_key();

        let peer = match self.selector.select(&key, &peers).and_then(|idx| peers.get(idx)) {
            Some(peer) if !peer.is_self => peer,
            _ => {
                if let Some(c) = &self.counters {
                    c.local.inc();
                }
                return next.execute(record).await;
            }
        };

        let payload = codec::encode(&record)?;
        match self
            .cluster
            .transport
            .send(peer, self.graph_id, self.target_node, payload)
            .await
        {
            Ok(()) => {
                if let Some(c) = &self.counters {
                    c.remote.inc();
                }
            }
            Err(e) => {
                // Dropped for this attempt; retrying is up to the transport.
                warn!(
                    peer = %peer,
                    graph_id = self.graph_id,
                    node_id = self.target_node,
                    key = %key,
                    error = %format!("{e:#}"),
                    "remote dispatch failed, record dropped",
                );
                if let Some(c) = &self.counters {
                    c.errors.inc();
                }
            }
        }

        Ok(())
    }
}

pub mod bridge;
pub mod codec;
pub mod error;
pub mod registry;

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::worker::{Next, NodeProcessor, StreamData, Worker, WorkerPool};

pub use bridge::GraphBridge;
pub use error::GraphError;
pub use registry::GraphManager;

/// Delivers an encoded message into one node without knowing its input type.
#[async_trait]
pub(crate) trait RemoteEntry: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> Result<(), GraphError>;
}

struct TypedEntry<I> {
    graph_id: u32,
    node_id: u32,
    processor: Arc<dyn NodeProcessor<I>>,
}

#[async_trait]
impl<I: StreamData> RemoteEntry for TypedEntry<I> {
    async fn deliver(&self, payload: &[u8]) -> Result<(), GraphError> {
        let message: I = codec::decode(payload).map_err(|source| GraphError::Decode {
            graph_id: self.graph_id,
            node_id: self.node_id,
            source,
        })?;

        self.processor
            .process(message)
            .await
            .map_err(|e| GraphError::Rejected {
                graph_id: self.graph_id,
                node_id: self.node_id,
                reason: format!("{e:#}"),
            })
    }
}

struct NodeSlot {
    /// Holds an `Arc<dyn NodeProcessor<I>>` for the node's input type.
    processor: Box<dyn Any + Send + Sync>,
    entry: Arc<dyn RemoteEntry>,
}

/// Node lookup table shared by a graph and all node builders derived from it.
pub(crate) struct NodeTable {
    graph_id: u32,
    nodes: RwLock<BTreeMap<u32, NodeSlot>>,
}

impl NodeTable {
    fn new(graph_id: u32) -> Self {
        Self {
            graph_id,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert<W: Worker>(
        self: &Arc<Self>,
        pool: &WorkerPool,
        worker: W,
    ) -> Result<(Arc<dyn NodeProcessor<W::Input>>, Node<W::Output>), GraphError> {
        let node_id = worker.id();
        let name = worker.name();

        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node_id) {
            return Err(GraphError::DuplicateNode {
                graph_id: self.graph_id,
                node_id,
            });
        }

        let next = Arc::new(Next::new());
        let processor: Arc<dyn NodeProcessor<W::Input>> =
            Arc::new(pool.spawn(self.graph_id, worker, Arc::clone(&next)));

        nodes.insert(
            node_id,
            NodeSlot {
                processor: Box::new(Arc::clone(&processor)),
                entry: Arc::new(TypedEntry {
                    graph_id: self.graph_id,
                    node_id,
                    processor: Arc::clone(&processor),
                }),
            },
        );

        Ok((
            processor,
            Node {
                graph_id: self.graph_id,
                id: node_id,
                name,
                next,
                table: Arc::clone(self),
            },
        ))
    }

    fn find<I: 'static>(&self, node_id: u32) -> Result<Arc<dyn NodeProcessor<I>>, GraphError> {
        let nodes = self.nodes.read();
        let slot = nodes.get(&node_id).ok_or(GraphError::NodeNotFound {
            graph_id: self.graph_id,
            node_id,
        })?;

        slot.processor
            .downcast_ref::<Arc<dyn NodeProcessor<I>>>()
            .cloned()
            .ok_or(GraphError::NodeTypeMismatch {
                graph_id: self.graph_id,
                node_id,
                expected: type_name::<I>(),
            })
    }

    pub(crate) fn entry(&self, node_id: u32) -> Option<Arc<dyn RemoteEntry>> {
        self.nodes
            .read()
            .get(&node_id)
            .map(|slot| Arc::clone(&slot.entry))
    }

    fn node_ids(&self) -> Vec<u32> {
        self.nodes.read().keys().copied().collect()
    }
}

/// A node under construction. `add_next` wires a successor and returns it,
/// so pipelines read as one fluent chain.
pub struct Node<O> {
    graph_id: u32,
    id: u32,
    name: &'static str,
    next: Arc<Next<O>>,
    table: Arc<NodeTable>,
}

impl<O: StreamData> Node<O> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn graph_id(&self) -> u32 {
        self.graph_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawns `worker` on `pool` and adds it as a successor of this node.
    pub fn add_next<W>(&self, pool: &WorkerPool, worker: W) -> Result<Node<W::Output>, GraphError>
    where
        W: Worker<Input = O>,
    {
        let (processor, node) = self.table.insert(pool, worker)?;
        self.next.add(processor);

        Ok(node)
    }

    /// Adds an arbitrary processor (typically a bridge) as a successor.
    pub fn add_processor(&self, processor: Arc<dyn NodeProcessor<O>>) {
        self.next.add(processor);
    }

    /// Forwards every message into `target`, re-typed by `map`. Messages
    /// mapped to `None` are skipped.
    pub fn bridge_to<U, F>(&self, target: Arc<Graph<U>>, map: F)
    where
        U: StreamData,
        F: Fn(O) -> Option<U> + Send + Sync + 'static,
    {
        self.add_processor(Arc::new(GraphBridge::new(target, map)));
    }

    pub fn successors(&self) -> usize {
        self.next.len()
    }
}

/// A named pipeline keyed by id and entry message type.
pub struct Graph<T> {
    id: u32,
    entry: Next<T>,
    table: Arc<NodeTable>,
}

impl<T: StreamData> Graph<T> {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            entry: Next::new(),
            table: Arc::new(NodeTable::new(id)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Spawns `worker` on `pool` as an entry node of this graph.
    pub fn add_node<W>(&self, pool: &WorkerPool, worker: W) -> Result<Node<W::Output>, GraphError>
    where
        W: Worker<Input = T>,
    {
        let (processor, node) = self.table.insert(pool, worker)?;
        self.entry.add(processor);

        Ok(node)
    }

    /// Pushes `message` into every entry node.
    pub async fn start(&self, message: T) -> Result<()> {
        if self.entry.is_empty() {
            return Err(GraphError::NoEntryNode { graph_id: self.id }.into());
        }
        self.entry.execute(message).await
    }

    /// Looks up a node accepting messages of type `I`.
    pub fn find_node<I: 'static>(&self, node_id: u32) -> Result<Arc<dyn NodeProcessor<I>>, GraphError> {
        self.table.find(node_id)
    }

    pub fn node_ids(&self) -> Vec<u32> {
        self.table.node_ids()
    }

    pub(crate) fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }
}

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::worker::{NodeProcessor, StreamData};

use super::{Graph, GraphError, NodeTable};

struct GraphEntry {
    graph: Arc<dyn Any + Send + Sync>,
    message_type: &'static str,
    table: Arc<NodeTable>,
}

/// Registry of every graph in the process. A graph id names exactly one
/// graph, whose message type is fixed by its first creation.
///
/// Constructed once by the core module and shared by reference with whatever
/// needs lookup (graph builders, remote dispatch, the RPC server).
#[derive(Default)]
pub struct GraphManager {
    graphs: RwLock<HashMap<u32, GraphEntry>>,
}

impl GraphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the graph `graph_id`, creating it for messages of `T` on
    /// first use. Fails if the id is already taken by another message type.
    pub fn create_if_absent<T: StreamData>(&self, graph_id: u32) -> Result<Arc<Graph<T>>, GraphError> {
        let mut graphs = self.graphs.write();
        if let Some(entry) = graphs.get(&graph_id) {
            return Arc::clone(&entry.graph)
                .downcast::<Graph<T>>()
                .map_err(|_| GraphError::GraphTypeConflict {
                    graph_id,
                    existing: entry.message_type,
                    requested: type_name::<T>(),
                });
        }

        let graph = Arc::new(Graph::<T>::new(graph_id));
        graphs.insert(
            graph_id,
            GraphEntry {
                graph: Arc::clone(&graph) as Arc<dyn Any + Send + Sync>,
                message_type: type_name::<T>(),
                table: Arc::clone(graph.table()),
            },
        );

        Ok(graph)
    }

    /// Looks up a previously created graph.
    pub fn find_graph<T: StreamData>(&self, graph_id: u32) -> Result<Arc<Graph<T>>, GraphError> {
        self.graphs
            .read()
            .get(&graph_id)
            .and_then(|entry| Arc::clone(&entry.graph).downcast::<Graph<T>>().ok())
            .ok_or(GraphError::GraphNotFound {
                graph_id,
                message_type: type_name::<T>(),
            })
    }

    /// Looks up node `node_id` of graph `graph_id`, whatever the graph's
    /// entry type, as a processor of `I`.
    pub fn find_node<I: 'static>(
        &self,
        graph_id: u32,
        node_id: u32,
    ) -> Result<Arc<dyn NodeProcessor<I>>, GraphError> {
        self.table(graph_id, type_name::<I>())?.find::<I>(node_id)
    }

    /// Decodes `payload` and pushes it into node `node_id` of graph
    /// `graph_id`. Receiving side of cluster dispatch.
    pub async fn deliver(&self, graph_id: u32, node_id: u32, payload: &[u8]) -> Result<(), GraphError> {
        let entry = self
            .table(graph_id, "any")?
            .entry(node_id)
            .ok_or(GraphError::NodeNotFound { graph_id, node_id })?;
        entry.deliver(payload).await
    }

    fn table(&self, graph_id: u32, message_type: &'static str) -> Result<Arc<NodeTable>, GraphError> {
        self.graphs
            .read()
            .get(&graph_id)
            .map(|entry| Arc::clone(&entry.table))
            .ok_or(GraphError::GraphNotFound {
                graph_id,
                message_type,
            })
    }

    /// Ids of every registered graph, ascending.
    pub fn graph_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.graphs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

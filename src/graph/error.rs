use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("graph {graph_id} for message type {message_type} not found")]
    GraphNotFound {
        graph_id: u32,
        message_type: &'static str,
    },

    #[error("graph {graph_id} carries {existing}, cannot also carry {requested}")]
    GraphTypeConflict {
        graph_id: u32,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("node {node_id} not found in graph {graph_id}")]
    NodeNotFound { graph_id: u32, node_id: u32 },

    #[error("node {node_id} in graph {graph_id} does not accept {expected}")]
    NodeTypeMismatch {
        graph_id: u32,
        node_id: u32,
        expected: &'static str,
    },

    #[error("node {node_id} already exists in graph {graph_id}")]
    DuplicateNode { graph_id: u32, node_id: u32 },

    #[error("graph {graph_id} has no entry node")]
    NoEntryNode { graph_id: u32 },

    #[error("decoding payload for node {node_id} in graph {graph_id}: {source}")]
    Decode {
        graph_id: u32,
        node_id: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("node {node_id} in graph {graph_id} rejected message: {reason}")]
    Rejected {
        graph_id: u32,
        node_id: u32,
        reason: String,
    },
}

impl GraphError {
    /// Whether the addressed graph or node does not exist on this process.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::GraphNotFound { .. } | Self::NodeNotFound { .. } | Self::NodeTypeMismatch { .. }
        )
    }
}

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::{ClusterSettings, Compression};
use crate::graph::GraphManager;

use super::membership::PeerAddress;

/// Delivers an encoded record to node `node_id` of graph `graph_id` on `peer`.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, peer: &PeerAddress, graph_id: u32, node_id: u32, payload: Vec<u8>) -> Result<()>;
}

/// HTTP transport: `POST http://{peer}/remote/{graph_id}/{node_id}`.
pub struct HttpTransport {
    client: reqwest::Client,
    compression: Compression,
}

impl HttpTransport {
    pub fn new(settings: &ClusterSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            compression: settings.compression,
        })
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn send(&self, peer: &PeerAddress, graph_id: u32, node_id: u32, payload: Vec<u8>) -> Result<()> {
        let body = compress(&payload, self.compression).context("compressing payload")?;

        let mut request = self
            .client
            .post(format!("http://{peer}/remote/{graph_id}/{node_id}"))
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(encoding) = self.compression.content_encoding() {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("sending to peer {peer}"))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("peer {peer} answered {status}");
        }

        Ok(())
    }
}

/// In-process transport delivering straight into other nodes' graph
/// registries. Used to run several nodes in one process.
#[derive(Default)]
pub struct LoopbackTransport {
    nodes: DashMap<String, Arc<GraphManager>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: &PeerAddress, graphs: Arc<GraphManager>) {
        self.nodes.insert(peer.to_string(), graphs);
    }

    /// Makes `peer` unreachable.
    pub fn disconnect(&self, peer: &PeerAddress) {
        self.nodes.remove(&peer.to_string());
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn send(&self, peer: &PeerAddress, graph_id: u32, node_id: u32, payload: Vec<u8>) -> Result<()> {
        let Some(graphs) = self
            .nodes
            .get(&peer.to_string())
            .map(|entry| Arc::clone(entry.value()))
        else {
            bail!("peer {peer} is unreachable");
        };

        graphs
            .deliver(graph_id, node_id, &payload)
            .await
            .with_context(|| format!("delivering to peer {peer}"))
    }
}

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::write::GzEncoder;

            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        Compression::Zstd => zstd::encode_all(data, 0).context("zstd encode"),
    }
}

/// Reverses `compress` given the request's `Content-Encoding`.
pub fn decompress(data: &[u8], content_encoding: Option<&str>) -> Result<Vec<u8>> {
    match content_encoding {
        None | Some("identity") => Ok(data.to_vec()),
        Some("gzip") => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).context("gzip decode")?;
            Ok(out)
        }
        Some("zstd") => zstd::decode_all(data).context("zstd decode"),
        Some(other) => bail!("unsupported content encoding: {other}"),
    }
}

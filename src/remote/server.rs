use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::export::health::{bind_address, HealthMetrics};
use crate::graph::{GraphError, GraphManager};

use super::transport::decompress;

/// Receiving side of cluster dispatch: re-injects records sent by peers
/// into the addressed node of the local graphs.
pub struct RemoteServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

struct AppState {
    graphs: Arc<GraphManager>,
    health: Option<Arc<HealthMetrics>>,
}

impl RemoteServer {
    pub fn new(addr: &str, graphs: Arc<GraphManager>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState { graphs, health }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/remote/:graph_id/:node_id", post(deliver_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Binds and serves in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = self.router();
        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "remote server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "remote server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn status_for(err: &GraphError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        GraphError::Decode { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// POST /remote/:graph_id/:node_id - deliver one encoded record.
async fn deliver_handler(
    State(state): State<Arc<AppState>>,
    Path((graph_id, node_id)): Path<(u32, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let encoding = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok());

    let payload = match decompress(&body, encoding) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(graph_id, node_id, error = %e, "undecodable remote payload");
            return (StatusCode::BAD_REQUEST, format!("{e:#}"));
        }
    };

    match state.graphs.deliver(graph_id, node_id, &payload).await {
        Ok(()) => {
            if let Some(health) = &state.health {
                health.remote_records_received.inc();
            }
            (StatusCode::OK, String::new())
        }
        Err(e) => {
            tracing::warn!(graph_id, node_id, error = %e, "remote delivery failed");
            (status_for(&e), e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::config::{ClusterSettings, Compression};
    use crate::graph::codec;
    use crate::graph::tests::{test_pool, wait_for, AddWorker, Collector};
    use crate::remote::membership::PeerAddress;
    use crate::remote::transport::{HttpTransport, RemoteTransport};

    #[tokio::test]
    async fn test_http_round_trip_into_graph() {
        let pool = test_pool();
        let graphs = Arc::new(GraphManager::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        graphs
            .create_if_absent::<u64>(301)
            .expect("graph")
            .add_node(&pool, AddWorker { id: 3, delta: 0 })
            .expect("node")
            .add_processor(Arc::new(Collector(Arc::clone(&seen))));

        let server = RemoteServer::new("127.0.0.1:0", Arc::clone(&graphs), None);
        let addr = server.start().await.expect("start");
        let peer = PeerAddress::new(addr.ip().to_string(), addr.port(), false);

        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let transport = HttpTransport::new(&ClusterSettings {
                compression,
                ..Default::default()
            })
            .expect("transport");
            let payload = codec::encode(&7u64).expect("encode");
            transport.send(&peer, 301, 3, payload).await.expect("send");
        }
        wait_for(|| seen.lock().len() == 3).await;

        let transport = HttpTransport::new(&ClusterSettings::default()).expect("transport");
        let err = transport
            .send(&peer, 999, 3, b"7".to_vec())
            .await
            .expect_err("unknown graph");
        assert!(err.to_string().contains("404"));

        let err = transport
            .send(&peer, 301, 3, b"not json".to_vec())
            .await
            .expect_err("bad payload");
        assert!(err.to_string().contains("400"));

        server.stop().await;
        pool.shutdown().await;
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&GraphError::NodeNotFound {
                graph_id: 1,
                node_id: 2
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&GraphError::Rejected {
                graph_id: 1,
                node_id: 2,
                reason: "mailbox full".to_string()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

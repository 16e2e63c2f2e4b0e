use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "collectoor";

/// Prometheus metrics for collector health.
///
/// All metrics use the "collectoor" namespace, grouped by pipeline concern:
/// workers, ingest, cluster dispatch, persistence and bootstrap.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Workers ===
    /// Messages handled by each worker.
    pub worker_messages_processed: CounterVec,
    /// Messages whose handler returned an error, per worker.
    pub worker_messages_failed: CounterVec,
    /// Offers refused because the worker's mailbox was full.
    pub worker_mailbox_rejected: CounterVec,
    /// End-of-batch signals delivered to each worker.
    pub worker_end_of_batch: CounterVec,
    /// Records emitted downstream by aggregation workers.
    pub aggregation_records_emitted: CounterVec,

    // === Ingest ===
    /// Raw telemetry received by kind (segment/instance_sample).
    pub ingested_total: CounterVec,

    // === Cluster ===
    /// Records routed by the remote stage, by mode (local/remote).
    pub remote_dispatches: CounterVec,
    /// Failed deliveries to peers. The records are dropped.
    pub remote_send_errors: Counter,
    /// Records accepted from peers by the RPC endpoint.
    pub remote_records_received: Counter,
    /// Current number of cluster members, self included.
    pub cluster_size: Gauge,

    // === Persistence ===
    /// Whole flush cycle duration.
    pub persistence_flush_duration: Histogram,
    /// Per-model prepare (swap, read, merge) duration.
    pub persistence_prepare_duration: HistogramVec,
    /// Batch upsert duration.
    pub persistence_upsert_duration: Histogram,
    /// Rows per upsert batch.
    pub persistence_batch_size: Histogram,
    /// Storage failures by stage (read/upsert).
    pub persistence_errors: CounterVec,
    /// Keys whose delta went back into the cache after a failure.
    pub persistence_requeued: Counter,
    /// Keys dropped after a failure when requeueing is disabled.
    pub persistence_dropped: Counter,

    // === Bootstrap ===
    /// Bootstrap duration by phase (prepare/start/notify).
    pub bootstrap_phase_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Workers ===
        let worker_messages_processed = CounterVec::new(
            Opts::new(
                "worker_messages_processed_total",
                "Total messages handled by each worker.",
            )
            .namespace(NAMESPACE),
            &["graph", "worker"],
        )?;
        let worker_messages_failed = CounterVec::new(
            Opts::new(
                "worker_messages_failed_total",
                "Total messages whose handler failed, per worker.",
            )
            .namespace(NAMESPACE),
            &["graph", "worker"],
        )?;
        let worker_mailbox_rejected = CounterVec::new(
            Opts::new(
                "worker_mailbox_rejected_total",
                "Total offers refused by a full mailbox, per worker.",
            )
            .namespace(NAMESPACE),
            &["graph", "worker"],
        )?;
        let worker_end_of_batch = CounterVec::new(
            Opts::new(
                "worker_end_of_batch_total",
                "Total end-of-batch signals delivered, per worker.",
            )
            .namespace(NAMESPACE),
            &["graph", "worker"],
        )?;
        let aggregation_records_emitted = CounterVec::new(
            Opts::new(
                "aggregation_records_emitted_total",
                "Total records emitted downstream by aggregation workers, per record model.",
            )
            .namespace(NAMESPACE),
            &["model"],
        )?;

        // === Ingest ===
        let ingested_total = CounterVec::new(
            Opts::new("ingested_total", "Total raw telemetry received by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;

        // === Cluster ===
        let remote_dispatches = CounterVec::new(
            Opts::new(
                "remote_dispatches_total",
                "Total records routed by the remote stage, by mode.",
            )
            .namespace(NAMESPACE),
            &["mode"],
        )?;
        let remote_send_errors = Counter::with_opts(
            Opts::new(
                "remote_send_errors_total",
                "Total failed deliveries to cluster peers.",
            )
            .namespace(NAMESPACE),
        )?;
        let remote_records_received = Counter::with_opts(
            Opts::new(
                "remote_records_received_total",
                "Total records accepted from cluster peers.",
            )
            .namespace(NAMESPACE),
        )?;
        let cluster_size = Gauge::with_opts(
            Opts::new("cluster_size", "Current number of cluster members.").namespace(NAMESPACE),
        )?;

        // === Persistence ===
        let persistence_flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "persistence_flush_duration_seconds",
                "Duration of a whole persistence cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let persistence_prepare_duration = HistogramVec::new(
            HistogramOpts::new(
                "persistence_prepare_duration_seconds",
                "Duration of the swap, read and merge step per model.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["model"],
        )?;
        let persistence_upsert_duration = Histogram::with_opts(
            HistogramOpts::new(
                "persistence_upsert_duration_seconds",
                "Duration of one batch upsert.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let persistence_batch_size = Histogram::with_opts(
            HistogramOpts::new("persistence_batch_size", "Rows per upsert batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 500.0, 1000.0, 2000.0, 5000.0]),
        )?;
        let persistence_errors = CounterVec::new(
            Opts::new(
                "persistence_errors_total",
                "Total storage failures by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let persistence_requeued = Counter::with_opts(
            Opts::new(
                "persistence_requeued_total",
                "Total keys requeued after a storage failure.",
            )
            .namespace(NAMESPACE),
        )?;
        let persistence_dropped = Counter::with_opts(
            Opts::new(
                "persistence_dropped_total",
                "Total keys dropped after a storage failure.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Bootstrap ===
        let bootstrap_phase_duration = GaugeVec::new(
            Opts::new(
                "bootstrap_phase_duration_seconds",
                "Module bootstrap duration by phase.",
            )
            .namespace(NAMESPACE),
            &["phase"],
        )?;

        registry.register(Box::new(worker_messages_processed.clone()))?;
        registry.register(Box::new(worker_messages_failed.clone()))?;
        registry.register(Box::new(worker_mailbox_rejected.clone()))?;
        registry.register(Box::new(worker_end_of_batch.clone()))?;
        registry.register(Box::new(aggregation_records_emitted.clone()))?;

        registry.register(Box::new(ingested_total.clone()))?;

        registry.register(Box::new(remote_dispatches.clone()))?;
        registry.register(Box::new(remote_send_errors.clone()))?;
        registry.register(Box::new(remote_records_received.clone()))?;
        registry.register(Box::new(cluster_size.clone()))?;

        registry.register(Box::new(persistence_flush_duration.clone()))?;
        registry.register(Box::new(persistence_prepare_duration.clone()))?;
        registry.register(Box::new(persistence_upsert_duration.clone()))?;
        registry.register(Box::new(persistence_batch_size.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;
        registry.register(Box::new(persistence_requeued.clone()))?;
        registry.register(Box::new(persistence_dropped.clone()))?;

        registry.register(Box::new(bootstrap_phase_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            worker_messages_processed,
            worker_messages_failed,
            worker_mailbox_rejected,
            worker_end_of_batch,
            aggregation_records_emitted,
            ingested_total,
            remote_dispatches,
            remote_send_errors,
            remote_records_received,
            cluster_size,
            persistence_flush_duration,
            persistence_prepare_duration,
            persistence_upsert_duration,
            persistence_batch_size,
            persistence_errors,
            persistence_requeued,
            persistence_dropped,
            bootstrap_phase_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Expands the ":port" shorthand to an all-interfaces bind address.
pub(crate) fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_shorthand() {
        assert_eq!(bind_address(":9090"), "0.0.0.0:9090");
        assert_eq!(bind_address(""), "0.0.0.0:9090");
        assert_eq!(bind_address("127.0.0.1:1234"), "127.0.0.1:1234");
    }

    #[test]
    fn test_render_uses_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health
            .worker_messages_processed
            .with_label_values(&["301", "aggregation"])
            .inc();
        health.persistence_requeued.inc_by(3.0);

        let text = health.render().expect("render");
        assert!(text.contains("collectoor_worker_messages_processed_total{graph=\"301\",worker=\"aggregation\"} 1"));
        assert!(text.contains("collectoor_persistence_requeued_total 3"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let addr = health.start().await.expect("start");
        assert_ne!(addr.port(), 0);
        health.stop().await.expect("stop");
    }
}

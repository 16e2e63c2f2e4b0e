//! Trace analysis: the graphs turning segments and instance samples into
//! persisted service, relation and instance metrics.

pub mod metrics;
pub mod model;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use crate::aggregation::{AggregationWorker, DownsamplingWorker, Transform};
use crate::config::{Config, DownsamplingLevel, PipelineConfig};
use crate::export::health::HealthMetrics;
use crate::graph::{Graph, GraphManager};
use crate::persistence::{PersistenceCache, PersistenceTimer, PersistenceWorker};
use crate::remote::{ClusterContext, RemoteWorker, Selector};
use crate::worker::{Next, Worker, WorkerPool};

use self::metrics::{InstanceMetricTransform, ServiceMetricTransform, ServiceRelationTransform};
use self::model::{InstanceSample, SpanEvent, TraceSegment};

/// Graph ids. Shared by every cluster member, since peers address each
/// other's nodes by id.
pub const SEGMENT_GRAPH: u32 = 300;
pub const SERVICE_METRIC_GRAPH: u32 = 301;
pub const SERVICE_RELATION_GRAPH: u32 = 302;
pub const INSTANCE_METRIC_GRAPH: u32 = 303;

pub const SEGMENT_PARSE_NODE: u32 = 1;

/// Node ids within every metric graph.
pub const AGGREGATION_NODE: u32 = 1;
pub const REMOTE_NODE: u32 = 2;
pub const DOWNSAMPLING_NODE: u32 = 3;
pub const PERSISTENCE_NODE: u32 = 4;

/// Splits a segment into one event per span.
pub struct SegmentParseWorker {
    id: u32,
}

impl SegmentParseWorker {
    pub fn new(id: u32) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Worker for SegmentParseWorker {
    type Input = TraceSegment;
    type Output = SpanEvent;

    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        "segment_parse"
    }

    async fn on_work(&mut self, segment: TraceSegment, next: &Next<SpanEvent>) -> Result<()> {
        let total = segment.spans.len();
        let mut failed = 0usize;
        let mut last_error = None;

        for span in segment.spans {
            let event = SpanEvent {
                service: segment.service.clone(),
                instance: segment.instance.clone(),
                span,
            };
            if let Err(e) = next.execute(event).await {
                failed += 1;
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => bail!(
                "segment {}: {failed} of {total} spans not delivered: {e:#}",
                segment.segment_id
            ),
            None => Ok(()),
        }
    }
}

/// One worker pool per stage. Graph edges only point from a stage to a later
/// one, so a producer blocked on a full mailbox never waits on its own pool.
pub struct StagePools {
    pub analysis: WorkerPool,
    pub aggregation: WorkerPool,
    pub remote: WorkerPool,
    pub downsampling: WorkerPool,
    pub persistence: WorkerPool,
}

impl StagePools {
    pub fn new(cfg: &PipelineConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            analysis: WorkerPool::new("analysis", cfg.analysis.clone(), health.clone()),
            aggregation: WorkerPool::new("aggregation", cfg.aggregation.clone(), health.clone()),
            remote: WorkerPool::new("remote", cfg.remote.clone(), health.clone()),
            downsampling: WorkerPool::new("downsampling", cfg.downsampling.clone(), health.clone()),
            persistence: WorkerPool::new("persistence", cfg.persistence.clone(), health),
        }
    }

    /// Stops the stages upstream first, so each stage's final flush still
    /// reaches a running downstream stage.
    pub async fn shutdown(&self) {
        for pool in [
            &self.analysis,
            &self.aggregation,
            &self.remote,
            &self.downsampling,
            &self.persistence,
        ] {
            pool.shutdown().await;
        }
    }
}

/// Builds the aggregation, remote, downsampling and persistence chain of one
/// metric graph and registers its cache with the timer.
#[allow(clippy::too_many_arguments)]
pub fn build_metric_graph<T: Transform>(
    graphs: &GraphManager,
    pools: &StagePools,
    graph_id: u32,
    transform: T,
    levels: &[DownsamplingLevel],
    cluster: &ClusterContext,
    timer: &PersistenceTimer,
    health: Option<&Arc<HealthMetrics>>,
) -> Result<Arc<Graph<T::Input>>> {
    let graph = graphs.create_if_absent::<T::Input>(graph_id)?;
    let cache = Arc::new(PersistenceCache::<T::Output>::new());
    timer.register(cache.clone());

    graph
        .add_node(
            &pools.aggregation,
            AggregationWorker::new(AGGREGATION_NODE, transform).with_health(health),
        )?
        .add_next(
            &pools.remote,
            RemoteWorker::<T::Output>::new(
                REMOTE_NODE,
                graph_id,
                DOWNSAMPLING_NODE,
                Selector::hash(),
                cluster.clone(),
            )
            .with_health(health),
        )?
        .add_next(
            &pools.downsampling,
            DownsamplingWorker::<T::Output>::new(DOWNSAMPLING_NODE, levels),
        )?
        .add_next(&pools.persistence, PersistenceWorker::new(PERSISTENCE_NODE, cache))?;

    Ok(graph)
}

/// The running set of analysis graphs of one collector node.
pub struct StreamGraphs {
    pools: StagePools,
    segments: Arc<Graph<TraceSegment>>,
    samples: Arc<Graph<InstanceSample>>,
    health: Option<Arc<HealthMetrics>>,
}

impl StreamGraphs {
    /// Creates every graph in `graphs` and spawns its workers. Must be called
    /// from within a tokio runtime.
    pub fn build(
        cfg: &Config,
        graphs: &GraphManager,
        cluster: &ClusterContext,
        timer: &PersistenceTimer,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let pools = StagePools::new(&cfg.pipeline, health.clone());
        let levels = &cfg.downsampling.levels;

        let invocations = build_metric_graph(
            graphs,
            &pools,
            SERVICE_METRIC_GRAPH,
            ServiceMetricTransform::new(cfg.analysis.apdex_threshold),
            levels,
            cluster,
            timer,
            health.as_ref(),
        )?;
        let calls = build_metric_graph(
            graphs,
            &pools,
            SERVICE_RELATION_GRAPH,
            ServiceRelationTransform,
            levels,
            cluster,
            timer,
            health.as_ref(),
        )?;
        let samples = build_metric_graph(
            graphs,
            &pools,
            INSTANCE_METRIC_GRAPH,
            InstanceMetricTransform,
            levels,
            cluster,
            timer,
            health.as_ref(),
        )?;

        let segments = graphs.create_if_absent::<TraceSegment>(SEGMENT_GRAPH)?;
        let parse = segments.add_node(&pools.analysis, SegmentParseWorker::new(SEGMENT_PARSE_NODE))?;
        parse.bridge_to(invocations, SpanEvent::into_invocation);
        parse.bridge_to(calls, SpanEvent::into_call);

        info!(graphs = ?graphs.graph_ids(), "analysis graphs built");

        Ok(Self {
            pools,
            segments,
            samples,
            health,
        })
    }

    pub async fn ingest_segment(&self, segment: TraceSegment) -> Result<()> {
        if let Some(health) = &self.health {
            health.ingested_total.with_label_values(&["segment"]).inc();
        }
        self.segments.start(segment).await
    }

    pub async fn ingest_instance_sample(&self, sample: InstanceSample) -> Result<()> {
        if let Some(health) = &self.health {
            health.ingested_total.with_label_values(&["instance_sample"]).inc();
        }
        self.samples.start(sample).await
    }

    /// Drains and stops every stage. Flushed records end up in the
    /// persistence caches.
    pub async fn shutdown(&self) {
        self.pools.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::StageConfig;
    use crate::graph::tests::Collector;
    use crate::record::{ColumnValue, Downsampling};
    use crate::remote::{LoopbackTransport, StaticMembership};
    use crate::storage::MemoryStorage;

    use super::model::{Span, SpanKind};

    const T0: i64 = 1_717_000_000_000;

    fn span(kind: SpanKind, peer: &str, duration: i64, is_error: bool) -> Span {
        Span {
            span_id: 0,
            parent_span_id: -1,
            kind,
            operation: "/checkout".to_string(),
            peer: peer.to_string(),
            component: "http".to_string(),
            start_time: T0,
            end_time: T0 + duration,
            is_error,
        }
    }

    fn segment(service: &str, spans: Vec<Span>) -> TraceSegment {
        TraceSegment {
            trace_id: "t-1".to_string(),
            segment_id: "s-1".to_string(),
            service: service.to_string(),
            instance: "i-1".to_string(),
            spans,
        }
    }

    fn standalone() -> ClusterContext {
        ClusterContext {
            membership: Arc::new(StaticMembership::standalone()),
            transport: Arc::new(LoopbackTransport::new()),
        }
    }

    fn fast_config() -> Config {
        let mut cfg = Config::default();
        let stage = StageConfig {
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        };
        cfg.pipeline = PipelineConfig {
            analysis: stage.clone(),
            aggregation: stage.clone(),
            remote: stage.clone(),
            downsampling: stage.clone(),
            persistence: stage,
        };
        cfg
    }

    fn long(storage: &MemoryStorage, model: &str, id: &str, column: &str) -> Option<i64> {
        match storage.get(model, id)?.get(column)? {
            ColumnValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_segment_parse_emits_every_span() {
        let mut worker = SegmentParseWorker::new(SEGMENT_PARSE_NODE);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let next = Next::new();
        next.add(Arc::new(Collector(Arc::clone(&seen))));

        worker
            .on_work(
                segment(
                    "orders",
                    vec![
                        span(SpanKind::Entry, "", 10, false),
                        span(SpanKind::Local, "", 1, false),
                        span(SpanKind::Exit, "payments", 5, false),
                    ],
                ),
                &next,
            )
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e: &SpanEvent| e.service == "orders" && e.instance == "i-1"));
    }

    #[tokio::test]
    async fn test_pipeline_persists_metrics_at_every_level() {
        let cfg = fast_config();
        let graphs = GraphManager::new();
        let storage = Arc::new(MemoryStorage::new());
        let timer = PersistenceTimer::new(cfg.persistence.clone(), storage.clone(), None);
        let streams = StreamGraphs::build(&cfg, &graphs, &standalone(), &timer, None).unwrap();
        assert_eq!(timer.registered(), 3);
        assert_eq!(graphs.graph_ids(), vec![300, 301, 302, 303]);

        streams
            .ingest_segment(segment(
                "orders",
                vec![
                    span(SpanKind::Entry, "", 20, false),
                    span(SpanKind::Exit, "payments", 15, true),
                ],
            ))
            .await
            .unwrap();
        streams
            .ingest_segment(segment("orders", vec![span(SpanKind::Entry, "", 30, true)]))
            .await
            .unwrap();
        streams
            .ingest_instance_sample(InstanceSample {
                service: "orders".to_string(),
                instance: "i-1".to_string(),
                timestamp: T0,
                cpu_percent: 40.0,
                heap_used: 1_024,
                gc_count: 2,
                agent_version: "9.1".to_string(),
            })
            .await
            .unwrap();

        streams.shutdown().await;
        let report = timer.flush_once().await;
        assert_eq!(report.failed, 0);

        let minute = Downsampling::Minute.bucket(T0).unwrap();
        let hour = Downsampling::Hour.bucket(T0).unwrap();
        let id = format!("{minute}_orders");
        assert_eq!(long(&storage, "service_metric_minute", &id, "calls"), Some(2));
        assert_eq!(long(&storage, "service_metric_minute", &id, "error_calls"), Some(1));
        assert_eq!(long(&storage, "service_metric_minute", &id, "duration_sum"), Some(50));
        assert_eq!(long(&storage, "service_metric_minute", &id, "avg_duration"), Some(25));
        assert_eq!(
            long(&storage, "service_metric_hour", &format!("{hour}_orders"), "calls"),
            Some(2)
        );
        assert_eq!(storage.ids("service_metric_day").len(), 1);

        let relation = format!("{minute}_orders->payments");
        assert_eq!(long(&storage, "service_relation_metric_minute", &relation, "calls"), Some(1));
        assert_eq!(long(&storage, "service_relation_metric_minute", &relation, "error_calls"), Some(1));

        let instance = format!("{minute}_i-1@orders");
        assert_eq!(long(&storage, "instance_metric_minute", &instance, "heap_max"), Some(1_024));
    }

    #[tokio::test]
    async fn test_extreme_span_times_do_not_stop_ingest() {
        let cfg = fast_config();
        let graphs = GraphManager::new();
        let storage = Arc::new(MemoryStorage::new());
        let timer = PersistenceTimer::new(cfg.persistence.clone(), storage.clone(), None);
        let streams = StreamGraphs::build(&cfg, &graphs, &standalone(), &timer, None).unwrap();

        let mut extreme = span(SpanKind::Entry, "", 0, false);
        extreme.start_time = i64::MIN;
        extreme.end_time = i64::MAX;
        streams
            .ingest_segment(segment("orders", vec![extreme]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        streams
            .ingest_segment(segment("orders", vec![span(SpanKind::Entry, "", 40, false)]))
            .await
            .expect("segment ingest still accepted");

        streams.shutdown().await;
        timer.flush_once().await;

        let id = format!("{}_orders", Downsampling::Minute.bucket(T0).unwrap());
        assert_eq!(long(&storage, "service_metric_minute", &id, "calls"), Some(1));
        assert_eq!(long(&storage, "service_metric_minute", &id, "duration_sum"), Some(40));
        assert_eq!(storage.ids("service_metric_minute").len(), 1);
    }

    #[tokio::test]
    async fn test_records_split_across_flushes_still_sum() {
        let cfg = fast_config();
        let graphs = GraphManager::new();
        let storage = Arc::new(MemoryStorage::new());
        let timer = PersistenceTimer::new(cfg.persistence.clone(), storage.clone(), None);
        let streams = StreamGraphs::build(&cfg, &graphs, &standalone(), &timer, None).unwrap();
        let id = format!("{}_orders", Downsampling::Minute.bucket(T0).unwrap());

        streams
            .ingest_segment(segment("orders", vec![span(SpanKind::Entry, "", 10, false)]))
            .await
            .unwrap();
        // First window reaches storage before the second one is ingested.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                timer.flush_once().await;
                if long(&storage, "service_metric_minute", &id, "calls") == Some(1) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first window flushed");

        streams
            .ingest_segment(segment("orders", vec![span(SpanKind::Entry, "", 10, false)]))
            .await
            .unwrap();
        streams.shutdown().await;
        timer.flush_once().await;

        assert_eq!(long(&storage, "service_metric_minute", &id, "calls"), Some(2));
        assert_eq!(long(&storage, "service_metric_minute", &id, "duration_sum"), Some(20));
    }
}

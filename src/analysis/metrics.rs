use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregation::Transform;
use crate::record::{Column, Downsampling, MergeOperation, Record};

use super::model::{InstanceSample, ServiceCall, ServiceInvocation};

const BASIS_POINTS: i64 = 10_000;

/// Apdex zone of a latency against the satisfied threshold T:
/// satisfied up to T, tolerating up to 4T, frustrated above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ApdexLevel {
    Satisfied = 0,
    Tolerating = 1,
    Frustrated = 2,
}

impl ApdexLevel {
    pub fn classify(latency_ms: i64, threshold_ms: i64) -> Self {
        if latency_ms <= threshold_ms {
            Self::Satisfied
        } else if latency_ms <= threshold_ms.saturating_mul(4) {
            Self::Tolerating
        } else {
            Self::Frustrated
        }
    }
}

fn average(sum: i64, count: i64) -> i64 {
    if count == 0 {
        0
    } else {
        sum / count
    }
}

/// Per-service traffic, latency and Apdex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetric {
    pub time_bucket: i64,
    pub service: String,
    pub calls: i64,
    pub error_calls: i64,
    pub duration_sum: i64,
    pub avg_duration: i64,
    /// Successful calls in basis points.
    pub success_rate: i64,
    pub apdex_threshold: i64,
    pub satisfied: i64,
    pub tolerating: i64,
    pub frustrated: i64,
    /// Apdex score in basis points.
    pub apdex_score: i64,
    /// `ApdexLevel` of the average latency.
    pub apdex_level: i32,
    pub last_seen: i64,
}

impl Record for ServiceMetric {
    const NAME: &'static str = "service_metric";

    fn columns() -> &'static [Column<Self>] {
        static COLUMNS: OnceLock<Vec<Column<ServiceMetric>>> = OnceLock::new();
        type C = Column<ServiceMetric>;
        COLUMNS.get_or_init(|| {
            vec![
                C::new("time_bucket", |r| &r.time_bucket, |r| &mut r.time_bucket, MergeOperation::NonMerge),
                C::new("service", |r| &r.service, |r| &mut r.service, MergeOperation::NonMerge),
                C::new("calls", |r| &r.calls, |r| &mut r.calls, MergeOperation::Sum),
                C::new("error_calls", |r| &r.error_calls, |r| &mut r.error_calls, MergeOperation::Sum),
                C::new("duration_sum", |r| &r.duration_sum, |r| &mut r.duration_sum, MergeOperation::Sum),
                C::derived("avg_duration", |r| &r.avg_duration, |r| &mut r.avg_duration, |r| {
                    average(r.duration_sum, r.calls)
                }),
                C::derived("success_rate", |r| &r.success_rate, |r| &mut r.success_rate, |r| {
                    if r.calls == 0 {
                        BASIS_POINTS
                    } else {
                        (r.calls - r.error_calls) * BASIS_POINTS / r.calls
                    }
                }),
                C::new("apdex_threshold", |r| &r.apdex_threshold, |r| &mut r.apdex_threshold, MergeOperation::Max),
                C::new("satisfied", |r| &r.satisfied, |r| &mut r.satisfied, MergeOperation::Sum),
                C::new("tolerating", |r| &r.tolerating, |r| &mut r.tolerating, MergeOperation::Sum),
                C::new("frustrated", |r| &r.frustrated, |r| &mut r.frustrated, MergeOperation::Sum),
                C::derived("apdex_score", |r| &r.apdex_score, |r| &mut r.apdex_score, |r| {
                    if r.calls == 0 {
                        BASIS_POINTS
                    } else {
                        (r.satisfied * 2 + r.tolerating) * BASIS_POINTS / (r.calls * 2)
                    }
                }),
                C::derived("apdex_level", |r| &r.apdex_level, |r| &mut r.apdex_level, |r| {
                    ApdexLevel::classify(average(r.duration_sum, r.calls), r.apdex_threshold) as i32
                }),
                C::new("last_seen", |r| &r.last_seen, |r| &mut r.last_seen, MergeOperation::Max),
            ]
        })
    }

    fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    fn set_time_bucket(&mut self, bucket: i64) {
        self.time_bucket = bucket;
    }

    fn entity_id(&self) -> String {
        self.service.clone()
    }

    fn timestamp(&self) -> i64 {
        self.last_seen
    }
}

/// Traffic between two services, seen from the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRelationMetric {
    pub time_bucket: i64,
    pub source: String,
    pub dest: String,
    pub calls: i64,
    pub error_calls: i64,
    pub duration_sum: i64,
    pub avg_duration: i64,
    pub max_duration: i64,
    pub min_duration: i64,
    /// Comma-separated set of client components.
    pub components: String,
    pub last_seen: i64,
}

impl Record for ServiceRelationMetric {
    const NAME: &'static str = "service_relation_metric";

    fn columns() -> &'static [Column<Self>] {
        static COLUMNS: OnceLock<Vec<Column<ServiceRelationMetric>>> = OnceLock::new();
        type C = Column<ServiceRelationMetric>;
        COLUMNS.get_or_init(|| {
            vec![
                C::new("time_bucket", |r| &r.time_bucket, |r| &mut r.time_bucket, MergeOperation::NonMerge),
                C::new("source", |r| &r.source, |r| &mut r.source, MergeOperation::NonMerge),
                C::new("dest", |r| &r.dest, |r| &mut r.dest, MergeOperation::NonMerge),
                C::new("calls", |r| &r.calls, |r| &mut r.calls, MergeOperation::Sum),
                C::new("error_calls", |r| &r.error_calls, |r| &mut r.error_calls, MergeOperation::Sum),
                C::new("duration_sum", |r| &r.duration_sum, |r| &mut r.duration_sum, MergeOperation::Sum),
                C::derived("avg_duration", |r| &r.avg_duration, |r| &mut r.avg_duration, |r| {
                    average(r.duration_sum, r.calls)
                }),
                C::new("max_duration", |r| &r.max_duration, |r| &mut r.max_duration, MergeOperation::Max),
                C::new("min_duration", |r| &r.min_duration, |r| &mut r.min_duration, MergeOperation::Min),
                C::new("components", |r| &r.components, |r| &mut r.components, MergeOperation::Append),
                C::new("last_seen", |r| &r.last_seen, |r| &mut r.last_seen, MergeOperation::Max),
            ]
        })
    }

    fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    fn set_time_bucket(&mut self, bucket: i64) {
        self.time_bucket = bucket;
    }

    fn entity_id(&self) -> String {
        format!("{}->{}", self.source, self.dest)
    }

    fn timestamp(&self) -> i64 {
        self.last_seen
    }
}

/// Runtime health of one service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetric {
    pub time_bucket: i64,
    pub service: String,
    pub instance: String,
    pub samples: i64,
    pub cpu_sum: f64,
    pub cpu_avg: f64,
    pub heap_max: i64,
    pub gc_count: i64,
    pub agent_version: String,
    pub last_update: i64,
}

impl Record for InstanceMetric {
    const NAME: &'static str = "instance_metric";

    fn columns() -> &'static [Column<Self>] {
        static COLUMNS: OnceLock<Vec<Column<InstanceMetric>>> = OnceLock::new();
        type C = Column<InstanceMetric>;
        COLUMNS.get_or_init(|| {
            vec![
                C::new("time_bucket", |r| &r.time_bucket, |r| &mut r.time_bucket, MergeOperation::NonMerge),
                C::new("service", |r| &r.service, |r| &mut r.service, MergeOperation::NonMerge),
                C::new("instance", |r| &r.instance, |r| &mut r.instance, MergeOperation::NonMerge),
                C::new("samples", |r| &r.samples, |r| &mut r.samples, MergeOperation::Sum),
                C::new("cpu_sum", |r| &r.cpu_sum, |r| &mut r.cpu_sum, MergeOperation::Sum),
                C::derived("cpu_avg", |r| &r.cpu_avg, |r| &mut r.cpu_avg, |r| {
                    if r.samples == 0 {
                        0.0
                    } else {
                        r.cpu_sum / r.samples as f64
                    }
                }),
                C::new("heap_max", |r| &r.heap_max, |r| &mut r.heap_max, MergeOperation::Max),
                C::new("gc_count", |r| &r.gc_count, |r| &mut r.gc_count, MergeOperation::Sum),
                C::new("agent_version", |r| &r.agent_version, |r| &mut r.agent_version, MergeOperation::Latest),
                C::new("last_update", |r| &r.last_update, |r| &mut r.last_update, MergeOperation::Max),
            ]
        })
    }

    fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    fn set_time_bucket(&mut self, bucket: i64) {
        self.time_bucket = bucket;
    }

    fn entity_id(&self) -> String {
        format!("{}@{}", self.instance, self.service)
    }

    fn timestamp(&self) -> i64 {
        self.last_update
    }
}

pub struct ServiceMetricTransform {
    apdex_threshold_ms: i64,
}

impl ServiceMetricTransform {
    pub fn new(apdex_threshold: Duration) -> Self {
        Self {
            apdex_threshold_ms: i64::try_from(apdex_threshold.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl Transform for ServiceMetricTransform {
    type Input = ServiceInvocation;
    type Output = ServiceMetric;

    fn transform(&self, inv: ServiceInvocation) -> Result<ServiceMetric> {
        let level = ApdexLevel::classify(inv.duration_ms, self.apdex_threshold_ms);

        Ok(ServiceMetric {
            time_bucket: Downsampling::Minute.bucket(inv.start_time)?,
            calls: 1,
            error_calls: i64::from(inv.is_error),
            duration_sum: inv.duration_ms,
            apdex_threshold: self.apdex_threshold_ms,
            satisfied: i64::from(level == ApdexLevel::Satisfied),
            tolerating: i64::from(level == ApdexLevel::Tolerating),
            frustrated: i64::from(level == ApdexLevel::Frustrated),
            last_seen: inv.start_time,
            service: inv.service,
            ..Default::default()
        })
    }
}

pub struct ServiceRelationTransform;

impl Transform for ServiceRelationTransform {
    type Input = ServiceCall;
    type Output = ServiceRelationMetric;

    fn transform(&self, call: ServiceCall) -> Result<ServiceRelationMetric> {
        Ok(ServiceRelationMetric {
            time_bucket: Downsampling::Minute.bucket(call.start_time)?,
            calls: 1,
            error_calls: i64::from(call.is_error),
            duration_sum: call.duration_ms,
            max_duration: call.duration_ms,
            min_duration: call.duration_ms,
            last_seen: call.start_time,
            source: call.source,
            dest: call.dest,
            components: call.component,
            ..Default::default()
        })
    }
}

pub struct InstanceMetricTransform;

impl Transform for InstanceMetricTransform {
    type Input = InstanceSample;
    type Output = InstanceMetric;

    fn transform(&self, sample: InstanceSample) -> Result<InstanceMetric> {
        Ok(InstanceMetric {
            time_bucket: Downsampling::Minute.bucket(sample.timestamp)?,
            samples: 1,
            cpu_sum: sample.cpu_percent,
            heap_max: sample.heap_used,
            gc_count: sample.gc_count,
            last_update: sample.timestamp,
            service: sample.service,
            instance: sample.instance,
            agent_version: sample.agent_version,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{apply_formulas, from_row, merge_record, to_row};

    const T0: i64 = 1_717_000_000_000;

    fn invocation(duration_ms: i64, is_error: bool) -> ServiceInvocation {
        ServiceInvocation {
            service: "checkout".to_string(),
            instance: "checkout-1".to_string(),
            start_time: T0,
            duration_ms,
            is_error,
        }
    }

    fn merged_all(records: &[ServiceMetric]) -> ServiceMetric {
        let mut acc = records[0].clone();
        apply_formulas(&mut acc);
        for r in &records[1..] {
            merge_record(&mut acc, r);
        }
        acc
    }

    #[test]
    fn test_apdex_classification() {
        assert_eq!(ApdexLevel::classify(100, 100), ApdexLevel::Satisfied);
        assert_eq!(ApdexLevel::classify(101, 100), ApdexLevel::Tolerating);
        assert_eq!(ApdexLevel::classify(400, 100), ApdexLevel::Tolerating);
        assert_eq!(ApdexLevel::classify(401, 100), ApdexLevel::Frustrated);
    }

    #[test]
    fn test_apdex_level_stays_satisfied_in_any_merge_order() {
        let transform = ServiceMetricTransform::new(Duration::from_millis(100));
        let parts: Vec<ServiceMetric> = [10, 25, 15]
            .into_iter()
            .map(|d| transform.transform(invocation(d, false)).unwrap())
            .collect();

        let orders = [[0, 1, 2], [2, 1, 0], [1, 0, 2], [1, 2, 0]];
        for order in orders {
            let records: Vec<ServiceMetric> = order.iter().map(|&i| parts[i].clone()).collect();

            let mut acc = records[0].clone();
            apply_formulas(&mut acc);
            assert_eq!(acc.apdex_level, ApdexLevel::Satisfied as i32);
            for r in &records[1..] {
                merge_record(&mut acc, r);
                assert_eq!(acc.apdex_level, ApdexLevel::Satisfied as i32);
            }

            assert_eq!(acc.duration_sum, 50);
            assert_eq!(acc.calls, 3);
            assert_eq!(acc.satisfied, 3);
            assert_eq!(acc.apdex_score, BASIS_POINTS);
        }
    }

    #[test]
    fn test_service_metric_formulas() {
        let transform = ServiceMetricTransform::new(Duration::from_millis(100));
        let records: Vec<ServiceMetric> = [(50, false), (250, true), (1000, false), (100, false)]
            .into_iter()
            .map(|(d, e)| transform.transform(invocation(d, e)).unwrap())
            .collect();

        let m = merged_all(&records);
        assert_eq!(m.calls, 4);
        assert_eq!(m.error_calls, 1);
        assert_eq!(m.avg_duration, 350);
        assert_eq!(m.success_rate, 7_500);
        assert_eq!((m.satisfied, m.tolerating, m.frustrated), (2, 1, 1));
        // (2 * 2 + 1) / (4 * 2)
        assert_eq!(m.apdex_score, 6_250);
        assert_eq!(m.apdex_level, ApdexLevel::Tolerating as i32);
        assert_eq!(m.time_bucket, Downsampling::Minute.bucket(T0).unwrap());
    }

    #[test]
    fn test_relation_min_max_and_components() {
        let call = |d: i64, component: &str| ServiceCall {
            source: "checkout".to_string(),
            dest: "payments".to_string(),
            component: component.to_string(),
            start_time: T0,
            duration_ms: d,
            is_error: false,
        };

        let mut acc = ServiceRelationTransform.transform(call(30, "http")).unwrap();
        apply_formulas(&mut acc);
        merge_record(&mut acc, &ServiceRelationTransform.transform(call(10, "grpc")).unwrap());
        merge_record(&mut acc, &ServiceRelationTransform.transform(call(50, "http")).unwrap());

        assert_eq!(acc.entity_id(), "checkout->payments");
        assert_eq!((acc.min_duration, acc.max_duration), (10, 50));
        assert_eq!(acc.avg_duration, 30);
        assert_eq!(acc.components, "grpc,http");
    }

    #[test]
    fn test_instance_version_is_latest_regardless_of_order() {
        let sample = |ts: i64, version: &str, cpu: f64| InstanceSample {
            service: "checkout".to_string(),
            instance: "checkout-1".to_string(),
            timestamp: ts,
            cpu_percent: cpu,
            heap_used: 100 + ts - T0,
            gc_count: 1,
            agent_version: version.to_string(),
        };
        let older = InstanceMetricTransform.transform(sample(T0, "9.0", 20.0)).unwrap();
        let newer = InstanceMetricTransform.transform(sample(T0 + 5_000, "9.1", 40.0)).unwrap();

        for (first, second) in [(&older, &newer), (&newer, &older)] {
            let mut acc = first.clone();
            apply_formulas(&mut acc);
            merge_record(&mut acc, second);
            assert_eq!(acc.agent_version, "9.1");
            assert_eq!(acc.samples, 2);
            assert_eq!(acc.cpu_avg, 30.0);
            assert_eq!(acc.heap_max, 5_100);
            assert_eq!(acc.last_update, T0 + 5_000);
        }
    }

    #[test]
    fn test_rows_carry_every_column() {
        let transform = ServiceMetricTransform::new(Duration::from_millis(500));
        let mut record = transform.transform(invocation(120, true)).unwrap();
        apply_formulas(&mut record);

        let row = to_row(&record);
        assert_eq!(row.len(), ServiceMetric::columns().len());
        assert_eq!(from_row::<ServiceMetric>(&row).unwrap(), record);
    }
}

//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink can
//! be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::core::{ClusterName, ErrorCode, ShardId, TaskId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

impl MetricLabel {
    fn new(key: &'static str, value: impl ToString) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

impl MetricEvent {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.key == key)
            .map(|label| label.value.as_str())
    }
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let (kind, value) = match event.value {
            MetricValue::Counter(value) => ("counter", value),
            MetricValue::Gauge(value) => ("gauge", value),
            MetricValue::Histogram(value) => ("histogram", value),
        };
        tracing::info!(
            target: "metrics",
            metric = event.name,
            kind,
            value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

fn operation_labels(operation: &'static str, polling_cluster: Option<&ClusterName>) -> Vec<MetricLabel> {
    let mut labels = vec![MetricLabel::new("operation", operation)];
    if let Some(cluster) = polling_cluster {
        labels.push(MetricLabel::new("polling_cluster", cluster));
    }
    labels
}

pub fn ack_request(operation: &'static str, polling_cluster: Option<&ClusterName>) {
    emit(
        "ack_manager_requests",
        MetricValue::Counter(1),
        operation_labels(operation, polling_cluster),
    );
}

pub fn ack_latency(
    operation: &'static str,
    polling_cluster: Option<&ClusterName>,
    duration: Duration,
) {
    emit(
        "ack_manager_latency_ms",
        MetricValue::Histogram(duration_ms(duration)),
        operation_labels(operation, polling_cluster),
    );
}

pub fn ack_failure(
    operation: &'static str,
    polling_cluster: Option<&ClusterName>,
    code: ErrorCode,
) {
    let mut labels = operation_labels(operation, polling_cluster);
    labels.push(MetricLabel::new("code", code));
    emit("ack_manager_failures", MetricValue::Counter(1), labels);
}

pub fn ack_tasks_returned(polling_cluster: &ClusterName, count: usize) {
    emit(
        "ack_manager_tasks_returned",
        MetricValue::Histogram(count as u64),
        operation_labels("get_tasks", Some(polling_cluster)),
    );
}

pub fn set_ack_max_task_id(shard: ShardId, max: TaskId) {
    emit(
        "ack_max_task_id",
        MetricValue::Gauge(max.get()),
        vec![MetricLabel::new("shard", shard)],
    );
}

pub fn long_poll_wakeup(shard: ShardId) {
    emit(
        "long_poll_wakeup",
        MetricValue::Counter(1),
        vec![MetricLabel::new("shard", shard)],
    );
}

pub fn long_poll_timeout(shard: ShardId) {
    emit(
        "long_poll_timeout",
        MetricValue::Counter(1),
        vec![MetricLabel::new("shard", shard)],
    );
}

pub fn set_repl_connections(value: usize) {
    emit("repl_connections", MetricValue::Gauge(value as u64), Vec::new());
}

pub fn repl_connection_rejected() {
    emit("repl_connection_rejected", MetricValue::Counter(1), Vec::new());
}


#[cfg(test)]
mod tests {
    use super::test_sink::{TestSink, lock};
    use super::*;

    #[test]
    fn emits_labelled_ack_metrics() {
        let _lock = lock();
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        let cluster = ClusterName::new("standby").unwrap();
        ack_request("get_tasks", Some(&cluster));
        ack_latency("get_tasks", Some(&cluster), Duration::from_millis(12));
        ack_failure("get_task", None, ErrorCode::NotFound);
        set_ack_max_task_id(ShardId::new(4), TaskId::new(77));

        let requests = sink.named("ack_manager_requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].label("polling_cluster"), Some("standby"));
        assert_eq!(
            sink.named("ack_manager_latency_ms")[0].value,
            MetricValue::Histogram(12)
        );
        let failures = sink.named("ack_manager_failures");
        assert_eq!(failures[0].label("code"), Some("not_found"));
        assert_eq!(failures[0].label("polling_cluster"), None);
        assert_eq!(
            sink.named("ack_max_task_id")[0].value,
            MetricValue::Gauge(77)
        );
    }
}

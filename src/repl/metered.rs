//! Metrics decorator for any [`AckManager`].

use std::time::Instant;

use crate::core::{ClusterName, ReplicationMessages, ReplicationTask, TaskDescriptor, TaskId};
use crate::metrics;

use super::ack_manager::{AckManager, AckManagerError};
use super::cancel::RequestContext;

/// Wraps an ack manager and reports request counts, latency and failures.
pub struct MeteredAckManager<A> {
    inner: A,
}

impl<A: AckManager> MeteredAckManager<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}

fn record_outcome<T>(
    operation: &'static str,
    polling_cluster: Option<&ClusterName>,
    started: Instant,
    result: &Result<T, AckManagerError>,
) {
    metrics::ack_latency(operation, polling_cluster, started.elapsed());
    if let Err(err) = result {
        metrics::ack_failure(operation, polling_cluster, err.code());
    }
}

impl<A: AckManager> AckManager for MeteredAckManager<A> {
    fn max_task_id(&self) -> TaskId {
        metrics::ack_request("max_task_id", None);
        self.inner.max_task_id()
    }

    fn notify_new_tasks(&self, task_ids: &[TaskId]) {
        metrics::ack_request("notify_new_tasks", None);
        let started = Instant::now();
        self.inner.notify_new_tasks(task_ids);
        metrics::ack_latency("notify_new_tasks", None, started.elapsed());
    }

    fn get_tasks(
        &self,
        ctx: &RequestContext,
        polling_cluster: &ClusterName,
        last_retrieved: TaskId,
    ) -> Result<ReplicationMessages, AckManagerError> {
        metrics::ack_request("get_tasks", Some(polling_cluster));
        let started = Instant::now();
        let result = self.inner.get_tasks(ctx, polling_cluster, last_retrieved);
        record_outcome("get_tasks", Some(polling_cluster), started, &result);
        if let Ok(messages) = &result {
            metrics::ack_tasks_returned(polling_cluster, messages.len());
        }
        result
    }

    fn get_task(
        &self,
        ctx: &RequestContext,
        descriptor: &TaskDescriptor,
    ) -> Result<ReplicationTask, AckManagerError> {
        metrics::ack_request("get_task", None);
        let started = Instant::now();
        let result = self.inner.get_task(ctx, descriptor);
        record_outcome("get_task", None, started, &result);
        result
    }
}

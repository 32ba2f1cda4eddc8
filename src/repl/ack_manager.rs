//! Ack tracking and long-poll delivery of a shard's replication tasks.
//!
//! The manager tracks the highest task id announced by the shard's task
//! generation path and serves ordered, gap-free batches above a caller's
//! cursor. It keeps no per-cluster state: every poll carries its own lower
//! bound, and advancing that bound is the caller's job once it has applied
//! the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::{
    ClusterName, Effect, ErrorCode, ErrorPayload, Limits, LimitsError, ReplicationMessages,
    ReplicationTask, ShardId, TaskDescriptor, TaskId, Transience,
};
use crate::metrics;

use super::cancel::RequestContext;
use super::hydrator::{HydrateError, TaskHydrator, hydrate_until};
use super::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
use super::reader::{ReadError, TaskReader};
use super::store::TaskLog;
use super::watch::{MaxTaskWatch, WaitOutcome};

/// Operations a shard exposes to its replication pollers.
pub trait AckManager: Send + Sync {
    /// Highest task id announced so far. Never blocks.
    fn max_task_id(&self) -> TaskId;

    /// Records newly appended task ids and wakes blocked pollers.
    fn notify_new_tasks(&self, task_ids: &[TaskId]);

    /// Tasks strictly above `last_retrieved`, ascending, bounded by the
    /// configured batch size and read budget. Blocks up to the long-poll
    /// timeout when nothing above `last_retrieved` has been announced.
    fn get_tasks(
        &self,
        ctx: &RequestContext,
        polling_cluster: &ClusterName,
        last_retrieved: TaskId,
    ) -> Result<ReplicationMessages, AckManagerError>;

    /// Hydrates a single known descriptor.
    fn get_task(
        &self,
        ctx: &RequestContext,
        descriptor: &TaskDescriptor,
    ) -> Result<ReplicationTask, AckManagerError>;
}

impl<A: AckManager + ?Sized> AckManager for Arc<A> {
    fn max_task_id(&self) -> TaskId {
        (**self).max_task_id()
    }

    fn notify_new_tasks(&self, task_ids: &[TaskId]) {
        (**self).notify_new_tasks(task_ids)
    }

    fn get_tasks(
        &self,
        ctx: &RequestContext,
        polling_cluster: &ClusterName,
        last_retrieved: TaskId,
    ) -> Result<ReplicationMessages, AckManagerError> {
        (**self).get_tasks(ctx, polling_cluster, last_retrieved)
    }

    fn get_task(
        &self,
        ctx: &RequestContext,
        descriptor: &TaskDescriptor,
    ) -> Result<ReplicationTask, AckManagerError> {
        (**self).get_task(ctx, descriptor)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckManagerError {
    #[error("ack manager is not running (state {state})")]
    ShuttingDown { state: LifecycleState },
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Hydrate(#[from] HydrateError),
}

impl AckManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AckManagerError::ShuttingDown { .. } => ErrorCode::ShuttingDown,
            AckManagerError::Cancelled => ErrorCode::Cancelled,
            AckManagerError::Read(err) => err.code(),
            AckManagerError::Hydrate(err) => err.code(),
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            AckManagerError::ShuttingDown { .. } | AckManagerError::Cancelled => {
                Transience::Retryable
            }
            AckManagerError::Read(err) => err.transience(),
            AckManagerError::Hydrate(err) => err.transience(),
        }
    }

    /// Reads never commit anything.
    pub fn effect(&self) -> Effect {
        Effect::None
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            AckManagerError::Hydrate(err) => Some(err.task_id()),
            _ => None,
        }
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        let payload =
            ErrorPayload::new(self.code(), self.to_string(), self.transience().is_retryable());
        match self.task_id() {
            Some(task_id) => payload.with_task_id(task_id),
            None => payload,
        }
    }
}

/// Immutable tuning for one ack manager, fixed at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckManagerConfig {
    pub max_batch_tasks: usize,
    pub max_read_duration: Duration,
    pub long_poll_timeout: Duration,
}

impl Default for AckManagerConfig {
    fn default() -> Self {
        Self {
            max_batch_tasks: 100,
            max_read_duration: Duration::from_secs(5),
            long_poll_timeout: Duration::from_secs(20),
        }
    }
}

impl AckManagerConfig {
    pub fn from_limits(limits: &Limits) -> Result<Self, LimitsError> {
        limits.validate()?;
        Ok(Self {
            max_batch_tasks: limits.max_batch_tasks,
            max_read_duration: Duration::from_millis(limits.max_read_duration_ms),
            long_poll_timeout: Duration::from_millis(limits.long_poll_timeout_ms),
        })
    }
}

/// Production ack manager for one shard.
pub struct ReplicationAckManager {
    shard: ShardId,
    config: AckManagerConfig,
    reader: TaskReader,
    hydrator: Arc<dyn TaskHydrator>,
    watch: Arc<MaxTaskWatch>,
    lifecycle: Lifecycle,
}

impl ReplicationAckManager {
    /// `initial_max` is the shard's highest persisted task id at load time.
    pub fn new(
        shard: ShardId,
        log: Arc<dyn TaskLog>,
        hydrator: Arc<dyn TaskHydrator>,
        config: AckManagerConfig,
        initial_max: TaskId,
    ) -> Self {
        Self {
            shard,
            config,
            reader: TaskReader::new(shard, log),
            hydrator,
            watch: Arc::new(MaxTaskWatch::new(initial_max)),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn config(&self) -> &AckManagerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        self.lifecycle.start()?;
        tracing::info!(shard = %self.shard, max_task_id = %self.watch.current(), "ack manager started");
        Ok(())
    }

    /// Stops serving. Blocked pollers return `ShuttingDown` promptly.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.stop()?;
        self.watch.close();
        tracing::info!(shard = %self.shard, "ack manager stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), AckManagerError> {
        match self.lifecycle.state() {
            LifecycleState::Running => Ok(()),
            state => Err(AckManagerError::ShuttingDown { state }),
        }
    }

    /// Waits for the maximum to exceed `after`. `Ok(None)` is a timeout.
    fn await_tasks_above(
        &self,
        ctx: &RequestContext,
        after: TaskId,
    ) -> Result<Option<TaskId>, AckManagerError> {
        let deadline = ctx.wait_deadline(Instant::now(), self.config.long_poll_timeout);
        match self.watch.wait_above(after, deadline, ctx.cancel_token()) {
            WaitOutcome::Advanced(max) => {
                metrics::long_poll_wakeup(self.shard);
                Ok(Some(max))
            }
            WaitOutcome::TimedOut => {
                metrics::long_poll_timeout(self.shard);
                Ok(None)
            }
            WaitOutcome::Cancelled => Err(AckManagerError::Cancelled),
            WaitOutcome::Closed => Err(AckManagerError::ShuttingDown {
                state: self.lifecycle.state(),
            }),
        }
    }
}

impl AckManager for ReplicationAckManager {
    fn max_task_id(&self) -> TaskId {
        self.watch.current()
    }

    fn notify_new_tasks(&self, task_ids: &[TaskId]) {
        let Some(max) = task_ids.iter().copied().max() else {
            return;
        };
        if self.watch.advance(max) {
            tracing::trace!(shard = %self.shard, max_task_id = %max, "max task id advanced");
            metrics::set_ack_max_task_id(self.shard, max);
        }
    }

    fn get_tasks(
        &self,
        ctx: &RequestContext,
        polling_cluster: &ClusterName,
        last_retrieved: TaskId,
    ) -> Result<ReplicationMessages, AckManagerError> {
        let span = tracing::debug_span!(
            "get_tasks",
            shard = %self.shard,
            polling_cluster = %polling_cluster,
            cursor = %last_retrieved
        );
        let _guard = span.enter();

        self.ensure_running()?;
        if ctx.is_cancelled() {
            return Err(AckManagerError::Cancelled);
        }

        let mut read_level = self.watch.current();
        if last_retrieved >= read_level {
            match self.await_tasks_above(ctx, last_retrieved)? {
                Some(max) => read_level = max,
                None => return Ok(ReplicationMessages::empty(last_retrieved)),
            }
        }

        // One processing budget covers both reading and hydration; the long
        // poll above is not part of it.
        let deadline = Instant::now() + self.config.max_read_duration;
        let outcome = self.reader.read(
            last_retrieved,
            read_level,
            self.config.max_batch_tasks,
            self.config.max_read_duration,
        )?;
        let hydrated = hydrate_until(
            self.hydrator.as_ref(),
            outcome.batch.descriptors(),
            deadline,
        )?;
        let tasks = hydrated.tasks;
        let has_more = outcome.has_more || !hydrated.complete;
        let cursor = match tasks.last() {
            Some(last) if !hydrated.complete => last.task_id,
            _ if outcome.has_more => outcome.batch.cursor(),
            _ => read_level,
        };

        tracing::debug!(
            read_level = %read_level,
            tasks = tasks.len(),
            has_more,
            next_cursor = %cursor,
            "served replication batch"
        );
        Ok(ReplicationMessages {
            tasks,
            last_retrieved_message_id: cursor,
            has_more,
        })
    }

    fn get_task(
        &self,
        ctx: &RequestContext,
        descriptor: &TaskDescriptor,
    ) -> Result<ReplicationTask, AckManagerError> {
        self.ensure_running()?;
        if ctx.is_cancelled() {
            return Err(AckManagerError::Cancelled);
        }
        self.hydrator.hydrate(descriptor).map_err(|err| {
            tracing::debug!(shard = %self.shard, task_id = %descriptor.task_id, error = %err, "get_task failed");
            AckManagerError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use bytes::Bytes;

    use crate::repl::cancel::CancelToken;
    use crate::repl::store::TaskLogError;
    use crate::test_harness::{MemoryPayloadStores, MemoryTaskLog, history_descriptor};

    const SHARD: ShardId = ShardId::new(3);

    struct Fixture {
        log: Arc<MemoryTaskLog>,
        stores: MemoryPayloadStores,
        manager: Arc<ReplicationAckManager>,
    }

    fn fixture(ids: impl IntoIterator<Item = u64>, config: AckManagerConfig) -> Fixture {
        let log = Arc::new(MemoryTaskLog::new());
        let stores = MemoryPayloadStores::new();
        for id in ids {
            let descriptor = history_descriptor(id);
            stores.put_history_for(&descriptor, Bytes::from(format!("events-{id}")));
            log.append(SHARD, descriptor);
        }
        let manager = Arc::new(ReplicationAckManager::new(
            SHARD,
            log.clone(),
            Arc::new(stores.hydrator()),
            config,
            TaskId::ZERO,
        ));
        manager.start().unwrap();
        Fixture {
            log,
            stores,
            manager,
        }
    }

    fn cluster() -> ClusterName {
        ClusterName::new("cluster-a").unwrap()
    }

    fn short_poll() -> AckManagerConfig {
        AckManagerConfig {
            long_poll_timeout: Duration::from_millis(50),
            ..AckManagerConfig::default()
        }
    }

    fn ids(messages: &ReplicationMessages) -> Vec<u64> {
        messages.task_ids().map(TaskId::get).collect()
    }

    #[test]
    fn from_limits_rejects_zero_batch() {
        let limits = Limits {
            max_batch_tasks: 0,
            ..Limits::default()
        };
        assert!(AckManagerConfig::from_limits(&limits).is_err());
        let config = AckManagerConfig::from_limits(&Limits::default()).unwrap();
        assert_eq!(config, AckManagerConfig::default());
    }

    #[test]
    fn notify_only_raises_max() {
        let fx = fixture(Vec::new(), short_poll());
        fx.manager.notify_new_tasks(&[]);
        assert_eq!(fx.manager.max_task_id(), TaskId::ZERO);
        fx.manager.notify_new_tasks(&[TaskId::new(4), TaskId::new(9), TaskId::new(2)]);
        assert_eq!(fx.manager.max_task_id(), TaskId::new(9));
        fx.manager.notify_new_tasks(&[TaskId::new(3)]);
        assert_eq!(fx.manager.max_task_id(), TaskId::new(9));
    }

    #[test]
    fn initial_max_is_served_without_notification() {
        let log = Arc::new(MemoryTaskLog::new());
        let stores = MemoryPayloadStores::new();
        for id in 1..=3 {
            let descriptor = history_descriptor(id);
            stores.put_history_for(&descriptor, Bytes::from_static(b"e"));
            log.append(SHARD, descriptor);
        }
        let manager = ReplicationAckManager::new(
            SHARD,
            log,
            Arc::new(stores.hydrator()),
            short_poll(),
            TaskId::new(3),
        );
        manager.start().unwrap();
        let messages = manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap();
        assert_eq!(ids(&messages), vec![1, 2, 3]);
    }

    #[test]
    fn never_serves_above_announced_max() {
        let fx = fixture(1..=8, short_poll());
        fx.manager.notify_new_tasks(&[TaskId::new(5)]);
        let messages = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap();
        assert_eq!(ids(&messages), vec![1, 2, 3, 4, 5]);
        assert!(!messages.has_more);
        assert_eq!(messages.last_retrieved_message_id, TaskId::new(5));
    }

    #[test]
    fn gap_only_range_advances_cursor_to_read_level() {
        let fx = fixture([2], short_poll());
        fx.manager.notify_new_tasks(&[TaskId::new(6)]);
        let messages = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::new(2))
            .unwrap();
        assert!(messages.is_empty());
        assert!(!messages.has_more);
        assert_eq!(messages.last_retrieved_message_id, TaskId::new(6));
    }

    #[test]
    fn caller_ahead_of_max_times_out_with_own_cursor() {
        let fx = fixture(1..=2, short_poll());
        fx.manager.notify_new_tasks(&[TaskId::new(2)]);
        let messages = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::new(40))
            .unwrap();
        assert!(messages.is_empty());
        assert_eq!(messages.last_retrieved_message_id, TaskId::new(40));
    }

    #[test]
    fn caller_deadline_bounds_long_poll() {
        let fx = fixture(Vec::new(), AckManagerConfig::default());
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(30));
        let started = Instant::now();
        let messages = fx.manager.get_tasks(&ctx, &cluster(), TaskId::ZERO).unwrap();
        assert!(messages.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_unblocks_poll_with_error() {
        let fx = fixture(Vec::new(), AckManagerConfig::default());
        let token = CancelToken::new();
        let poller = {
            let manager = Arc::clone(&fx.manager);
            let ctx = RequestContext::new().with_cancel(token.clone());
            thread::spawn(move || manager.get_tasks(&ctx, &cluster(), TaskId::ZERO))
        };
        thread::sleep(Duration::from_millis(30));
        token.cancel();
        let err = poller.join().expect("poller").unwrap_err();
        assert_eq!(err, AckManagerError::Cancelled);
        assert!(err.transience().is_retryable());
    }

    #[test]
    fn stop_unblocks_poll_and_rejects_new_calls() {
        let fx = fixture(Vec::new(), AckManagerConfig::default());
        let poller = {
            let manager = Arc::clone(&fx.manager);
            thread::spawn(move || manager.get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO))
        };
        thread::sleep(Duration::from_millis(30));
        fx.manager.stop().unwrap();
        let err = poller.join().expect("poller").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShuttingDown);

        let err = fx
            .manager
            .get_task(&RequestContext::new(), &history_descriptor(1))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShuttingDown);
        // Producers may still announce tasks.
        fx.manager.notify_new_tasks(&[TaskId::new(1)]);
        assert_eq!(fx.manager.max_task_id(), TaskId::new(1));
    }

    #[test]
    fn not_started_rejects_polls() {
        let log = Arc::new(MemoryTaskLog::new());
        let stores = MemoryPayloadStores::new();
        let manager = ReplicationAckManager::new(
            SHARD,
            log,
            Arc::new(stores.hydrator()),
            short_poll(),
            TaskId::ZERO,
        );
        let err = manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap_err();
        assert_eq!(
            err,
            AckManagerError::ShuttingDown {
                state: LifecycleState::Created
            }
        );
    }

    #[test]
    fn read_failure_fails_whole_batch() {
        let fx = fixture(1..=5, short_poll());
        fx.manager.notify_new_tasks(&[TaskId::new(5)]);
        fx.log.fail_next_reads(1, TaskLogError::Unavailable {
            reason: "replica lagging".into(),
        });
        let err = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(err.transience().is_retryable());

        let retry = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap();
        assert_eq!(retry.len(), 5);
    }

    #[test]
    fn slow_hydration_cuts_batch_at_budget() {
        let config = AckManagerConfig {
            max_read_duration: Duration::from_millis(60),
            ..short_poll()
        };
        let fx = fixture(1..=10, config);
        fx.manager.notify_new_tasks(&[TaskId::new(10)]);
        fx.stores.set_read_delay(Duration::from_millis(25));

        let first = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap();
        let got = ids(&first);
        assert!(!got.is_empty() && got.len() < 10, "hydrated {got:?}");
        assert_eq!(got, (1..=got.len() as u64).collect::<Vec<_>>());
        assert!(first.has_more);
        assert_eq!(
            first.last_retrieved_message_id,
            TaskId::new(got.len() as u64)
        );

        fx.stores.set_read_delay(Duration::ZERO);
        let rest = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), first.last_retrieved_message_id)
            .unwrap();
        assert_eq!(ids(&rest), (got.len() as u64 + 1..=10).collect::<Vec<_>>());
        assert!(!rest.has_more);
        assert_eq!(rest.last_retrieved_message_id, TaskId::new(10));
    }

    #[test]
    fn hydration_failure_fails_whole_batch() {
        let fx = fixture(1..=5, short_poll());
        fx.manager.notify_new_tasks(&[TaskId::new(5)]);
        fx.stores.remove_history_for(&history_descriptor(3));
        let err = fx
            .manager
            .get_tasks(&RequestContext::new(), &cluster(), TaskId::ZERO)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.task_id(), Some(TaskId::new(3)));
        assert_eq!(err.as_error_payload().task_id, Some(TaskId::new(3)));
    }

    #[test]
    fn get_task_hydrates_single_descriptor() {
        let fx = fixture(1..=2, short_poll());
        let task = fx
            .manager
            .get_task(&RequestContext::new(), &history_descriptor(2))
            .unwrap();
        assert_eq!(task.task_id, TaskId::new(2));
        let err = fx
            .manager
            .get_task(&RequestContext::new(), &history_descriptor(9))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}

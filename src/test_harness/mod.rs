//! In-memory task log, payload stores and a scripted ack manager for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use uuid::Uuid;

use crate::core::{
    ActivitySnapshot, ClusterName, DataBlob, HistoryTaskAttributes, NamespaceId, NamespaceRecord,
    NamespaceState, ReplicationMessages, ReplicationTask, ReplicationTaskAttributes, RunId,
    SchedulingMetadata, ShardId, TaskDescriptor, TaskId, TaskType, WorkflowId,
};
use crate::repl::{
    AckManager, AckManagerConfig, AckManagerError, ActivityStore, HistoryRange, HistoryStore,
    HydrateError, NamespaceStore, PayloadError, ReplicationAckManager, RequestContext,
    StoreHydrator, TaskLog, TaskLogError, TaskLogPage,
};

const BASE_VISIBILITY_MS: u64 = 1_700_000_000_000;

pub fn sample_namespace_id() -> NamespaceId {
    NamespaceId::new(Uuid::from_bytes([0x11; 16]))
}

pub fn sample_run_id() -> RunId {
    RunId::new(Uuid::from_bytes([0x22; 16]))
}

pub fn sample_workflow_id() -> WorkflowId {
    WorkflowId::new("order-fulfilment").expect("sample workflow id is valid")
}

fn descriptor(id: u64, task_type: TaskType, scheduling: SchedulingMetadata) -> TaskDescriptor {
    TaskDescriptor::new(
        TaskId::new(id),
        task_type,
        sample_namespace_id(),
        sample_workflow_id(),
        sample_run_id(),
    )
    .with_scheduling(scheduling)
}

/// History descriptor whose event range and branch are derived from `id`.
pub fn history_descriptor(id: u64) -> TaskDescriptor {
    let first = (id as i64) * 10;
    descriptor(
        id,
        TaskType::History,
        SchedulingMetadata {
            version: 1,
            first_event_id: first,
            next_event_id: first + 5,
            branch_token: Bytes::from(format!("branch-{id}")),
            visibility_time_ms: BASE_VISIBILITY_MS + id,
            ..SchedulingMetadata::default()
        },
    )
}

pub fn activity_descriptor(id: u64) -> TaskDescriptor {
    descriptor(
        id,
        TaskType::SyncActivity,
        SchedulingMetadata {
            version: 1,
            scheduled_event_id: (id as i64) * 10,
            visibility_time_ms: BASE_VISIBILITY_MS + id,
            ..SchedulingMetadata::default()
        },
    )
}

pub fn namespace_descriptor(id: u64) -> TaskDescriptor {
    descriptor(
        id,
        TaskType::Namespace,
        SchedulingMetadata {
            visibility_time_ms: BASE_VISIBILITY_MS + id,
            ..SchedulingMetadata::default()
        },
    )
}

pub fn sample_activity() -> ActivitySnapshot {
    ActivitySnapshot {
        version: 1,
        scheduled_event_id: 30,
        scheduled_time_ms: BASE_VISIBILITY_MS,
        started_event_id: 31,
        started_time_ms: Some(BASE_VISIBILITY_MS + 40),
        last_heartbeat_time_ms: Some(BASE_VISIBILITY_MS + 90),
        details: Some(DataBlob::new("json", Bytes::from_static(b"{\"progress\":3}"))),
        attempt: 2,
        last_failure: Some("worker lost".to_string()),
        last_worker_identity: Some("worker-7".to_string()),
    }
}

pub fn sample_namespace_record() -> NamespaceRecord {
    NamespaceRecord {
        id: sample_namespace_id(),
        name: "payments".to_string(),
        state: NamespaceState::Registered,
        description: "payment workflows".to_string(),
        owner_email: "payments@example.com".to_string(),
        retention_days: 7,
        config_version: 4,
        failover_version: 12,
        is_global: true,
    }
}

/// Hydrated history task matching `history_descriptor(id)`.
pub fn sample_history_task(id: u64) -> ReplicationTask {
    let descriptor = history_descriptor(id);
    ReplicationTask {
        task_id: descriptor.task_id,
        visibility_time_ms: descriptor.scheduling.visibility_time_ms,
        attributes: ReplicationTaskAttributes::History(HistoryTaskAttributes {
            namespace_id: descriptor.namespace_id,
            workflow_id: descriptor.workflow_id,
            run_id: descriptor.run_id,
            version: descriptor.scheduling.version,
            first_event_id: descriptor.scheduling.first_event_id,
            next_event_id: descriptor.scheduling.next_event_id,
            events: DataBlob::new("test", Bytes::from(format!("events-{id}"))),
            new_run_events: None,
        }),
    }
}

pub fn sample_messages(ids: &[u64], has_more: bool) -> ReplicationMessages {
    ReplicationMessages {
        tasks: ids.iter().copied().map(sample_history_task).collect(),
        last_retrieved_message_id: ids.last().copied().map_or(TaskId::ZERO, TaskId::new),
        has_more,
    }
}

#[derive(Default)]
struct TaskLogState {
    shards: BTreeMap<ShardId, BTreeMap<TaskId, TaskDescriptor>>,
    page_cap: Option<usize>,
    failures: VecDeque<TaskLogError>,
    reads: usize,
}

/// Task log backed by ordered maps, with page caps and injected failures.
#[derive(Default)]
pub struct MemoryTaskLog {
    state: Mutex<TaskLogState>,
}

impl MemoryTaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, shard: ShardId, descriptor: TaskDescriptor) {
        let mut state = self.state.lock().expect("task log lock poisoned");
        state
            .shards
            .entry(shard)
            .or_default()
            .insert(descriptor.task_id, descriptor);
    }

    /// Removes an entry, leaving a gap in the id sequence.
    pub fn remove(&self, shard: ShardId, task_id: TaskId) -> Option<TaskDescriptor> {
        let mut state = self.state.lock().expect("task log lock poisoned");
        state.shards.get_mut(&shard)?.remove(&task_id)
    }

    /// Caps every page below the caller's limit.
    pub fn set_page_cap(&self, cap: Option<usize>) {
        self.state.lock().expect("task log lock poisoned").page_cap = cap;
    }

    pub fn fail_next_reads(&self, count: usize, err: TaskLogError) {
        let mut state = self.state.lock().expect("task log lock poisoned");
        for _ in 0..count {
            state.failures.push_back(err.clone());
        }
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().expect("task log lock poisoned").reads
    }
}

impl TaskLog for MemoryTaskLog {
    fn read_descriptors(
        &self,
        shard: ShardId,
        after: TaskId,
        limit: usize,
        _time_budget: Duration,
    ) -> Result<TaskLogPage, TaskLogError> {
        let mut state = self.state.lock().expect("task log lock poisoned");
        state.reads += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let limit = state.page_cap.map_or(limit, |cap| cap.min(limit));
        let Some(entries) = state.shards.get(&shard) else {
            return Ok(TaskLogPage::default());
        };
        let mut range = entries.range((Bound::Excluded(after), Bound::Unbounded));
        let descriptors: Vec<TaskDescriptor> =
            range.by_ref().take(limit).map(|(_, d)| d.clone()).collect();
        let has_more = range.next().is_some();
        Ok(TaskLogPage {
            descriptors,
            has_more,
        })
    }
}

#[derive(Default)]
struct PayloadState {
    history: HashMap<(Bytes, i64, i64), Bytes>,
    first_batches: HashMap<Bytes, Bytes>,
    activities: HashMap<(RunId, i64), ActivitySnapshot>,
    namespaces: HashMap<NamespaceId, NamespaceRecord>,
    unavailable: bool,
    read_delay: Duration,
}

/// History, activity and namespace stores sharing one in-memory state.
#[derive(Clone, Default)]
pub struct MemoryPayloadStores {
    state: Arc<Mutex<PayloadState>>,
}

impl MemoryPayloadStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydrator(&self) -> StoreHydrator {
        StoreHydrator::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    pub fn put_history_for(&self, descriptor: &TaskDescriptor, events: Bytes) {
        let key = history_key(&descriptor.scheduling);
        self.lock().history.insert(key, events);
    }

    pub fn remove_history_for(&self, descriptor: &TaskDescriptor) {
        let key = history_key(&descriptor.scheduling);
        self.lock().history.remove(&key);
    }

    pub fn put_first_batch(&self, branch_token: Bytes, events: Bytes) {
        self.lock().first_batches.insert(branch_token, events);
    }

    pub fn put_activity_for(&self, descriptor: &TaskDescriptor) {
        let scheduled = descriptor.scheduling.scheduled_event_id;
        let activity = ActivitySnapshot {
            scheduled_event_id: scheduled,
            ..sample_activity()
        };
        self.lock()
            .activities
            .insert((descriptor.run_id, scheduled), activity);
    }

    pub fn put_namespace(&self, record: NamespaceRecord) {
        self.lock().namespaces.insert(record.id, record);
    }

    pub fn put_sample_namespace(&self) {
        self.put_namespace(sample_namespace_record());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Every payload read sleeps this long before touching the maps.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PayloadState> {
        self.state.lock().expect("payload store lock poisoned")
    }

    fn available(&self) -> Result<std::sync::MutexGuard<'_, PayloadState>, PayloadError> {
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let state = self.lock();
        if state.unavailable {
            return Err(PayloadError::unavailable("injected outage"));
        }
        Ok(state)
    }
}

fn history_key(scheduling: &SchedulingMetadata) -> (Bytes, i64, i64) {
    (
        scheduling.branch_token.clone(),
        scheduling.first_event_id,
        scheduling.next_event_id,
    )
}

impl HistoryStore for MemoryPayloadStores {
    fn read_events(&self, range: &HistoryRange) -> Result<DataBlob, PayloadError> {
        let key = (
            range.branch_token.clone(),
            range.first_event_id,
            range.next_event_id,
        );
        self.available()?
            .history
            .get(&key)
            .cloned()
            .map(|data| DataBlob::new("test", data))
            .ok_or_else(|| {
                PayloadError::not_found(format!(
                    "history events [{}, {})",
                    range.first_event_id, range.next_event_id
                ))
            })
    }

    fn read_first_batch(
        &self,
        _namespace_id: NamespaceId,
        branch_token: &Bytes,
    ) -> Result<DataBlob, PayloadError> {
        self.available()?
            .first_batches
            .get(branch_token)
            .cloned()
            .map(|data| DataBlob::new("test", data))
            .ok_or_else(|| PayloadError::not_found("new run first batch"))
    }
}

impl ActivityStore for MemoryPayloadStores {
    fn load_activity(
        &self,
        _namespace_id: NamespaceId,
        _workflow_id: &WorkflowId,
        run_id: RunId,
        scheduled_event_id: i64,
    ) -> Result<ActivitySnapshot, PayloadError> {
        self.available()?
            .activities
            .get(&(run_id, scheduled_event_id))
            .cloned()
            .ok_or_else(|| PayloadError::not_found(format!("activity {scheduled_event_id}")))
    }
}

impl NamespaceStore for MemoryPayloadStores {
    fn load_namespace(&self, namespace_id: NamespaceId) -> Result<NamespaceRecord, PayloadError> {
        self.available()?
            .namespaces
            .get(&namespace_id)
            .cloned()
            .ok_or_else(|| PayloadError::not_found(format!("namespace {namespace_id}")))
    }
}

/// A shard's task log and payloads wired to a running ack manager.
pub struct MemoryShard {
    pub shard: ShardId,
    pub log: Arc<MemoryTaskLog>,
    pub stores: MemoryPayloadStores,
    pub manager: Arc<ReplicationAckManager>,
}

impl MemoryShard {
    /// Started manager over an empty log with `initial_max` of zero.
    pub fn start(shard: ShardId, config: AckManagerConfig) -> Self {
        let log = Arc::new(MemoryTaskLog::new());
        let stores = MemoryPayloadStores::new();
        let manager = Arc::new(ReplicationAckManager::new(
            shard,
            log.clone(),
            Arc::new(stores.hydrator()),
            config,
            TaskId::ZERO,
        ));
        manager
            .start()
            .expect("fresh ack manager starts from created");
        Self {
            shard,
            log,
            stores,
            manager,
        }
    }

    /// Persists history tasks with payloads; does not notify.
    pub fn append_history(&self, ids: impl IntoIterator<Item = u64>) -> Vec<TaskId> {
        ids.into_iter()
            .map(|id| {
                let descriptor = history_descriptor(id);
                self.stores
                    .put_history_for(&descriptor, Bytes::from(format!("events-{id}")));
                self.log.append(self.shard, descriptor);
                TaskId::new(id)
            })
            .collect()
    }

    /// Persists and announces in one step, as a committing writer would.
    pub fn commit_history(&self, ids: impl IntoIterator<Item = u64>) {
        let ids = self.append_history(ids);
        self.manager.notify_new_tasks(&ids);
    }
}

type GetTasksResult = Result<ReplicationMessages, AckManagerError>;
type GetTaskResult = Result<ReplicationTask, AckManagerError>;

/// Ack manager double that replays scripted results and records calls.
///
/// Unscripted `get_tasks` calls return an empty batch at the caller's cursor;
/// unscripted `get_task` calls report the descriptor as not found.
pub struct FakeAckManager {
    max: AtomicU64,
    get_tasks_tx: Sender<GetTasksResult>,
    get_tasks_rx: Receiver<GetTasksResult>,
    get_task_tx: Sender<GetTaskResult>,
    get_task_rx: Receiver<GetTaskResult>,
    get_tasks_calls: Mutex<Vec<(ClusterName, TaskId)>>,
    notified: Mutex<Vec<Vec<TaskId>>>,
}

impl Default for FakeAckManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAckManager {
    pub fn new() -> Self {
        let (get_tasks_tx, get_tasks_rx) = unbounded();
        let (get_task_tx, get_task_rx) = unbounded();
        Self {
            max: AtomicU64::new(0),
            get_tasks_tx,
            get_tasks_rx,
            get_task_tx,
            get_task_rx,
            get_tasks_calls: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
        }
    }

    pub fn push_get_tasks(&self, result: GetTasksResult) {
        let _ = self.get_tasks_tx.send(result);
    }

    pub fn push_get_task(&self, result: GetTaskResult) {
        let _ = self.get_task_tx.send(result);
    }

    pub fn get_tasks_calls(&self) -> Vec<(ClusterName, TaskId)> {
        self.get_tasks_calls
            .lock()
            .expect("fake calls lock poisoned")
            .clone()
    }

    pub fn notified(&self) -> Vec<Vec<TaskId>> {
        self.notified
            .lock()
            .expect("fake notified lock poisoned")
            .clone()
    }
}

impl AckManager for FakeAckManager {
    fn max_task_id(&self) -> TaskId {
        TaskId::new(self.max.load(Ordering::SeqCst))
    }

    fn notify_new_tasks(&self, task_ids: &[TaskId]) {
        if let Some(max) = task_ids.iter().copied().max() {
            self.max.fetch_max(max.get(), Ordering::SeqCst);
        }
        self.notified
            .lock()
            .expect("fake notified lock poisoned")
            .push(task_ids.to_vec());
    }

    fn get_tasks(
        &self,
        _ctx: &RequestContext,
        polling_cluster: &ClusterName,
        last_retrieved: TaskId,
    ) -> GetTasksResult {
        self.get_tasks_calls
            .lock()
            .expect("fake calls lock poisoned")
            .push((polling_cluster.clone(), last_retrieved));
        self.get_tasks_rx
            .try_recv()
            .unwrap_or_else(|_| Ok(ReplicationMessages::empty(last_retrieved)))
    }

    fn get_task(&self, _ctx: &RequestContext, descriptor: &TaskDescriptor) -> GetTaskResult {
        self.get_task_rx.try_recv().unwrap_or_else(|_| {
            Err(AckManagerError::Hydrate(HydrateError::NotFound {
                task_id: descriptor.task_id,
                what: "unscripted task".to_string(),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_pages_and_reports_more() {
        let log = MemoryTaskLog::new();
        let shard = ShardId::new(1);
        for id in [1, 2, 4, 8] {
            log.append(shard, history_descriptor(id));
        }
        let page = log
            .read_descriptors(shard, TaskId::new(1), 2, Duration::from_secs(1))
            .unwrap();
        let ids: Vec<u64> = page.descriptors.iter().map(|d| d.task_id.get()).collect();
        assert_eq!(ids, vec![2, 4]);
        assert!(page.has_more);

        let page = log
            .read_descriptors(shard, TaskId::new(4), 10, Duration::from_secs(1))
            .unwrap();
        assert_eq!(page.descriptors.len(), 1);
        assert!(!page.has_more);

        let other = log
            .read_descriptors(ShardId::new(2), TaskId::ZERO, 10, Duration::from_secs(1))
            .unwrap();
        assert!(other.descriptors.is_empty());
        assert_eq!(log.read_count(), 3);
    }

    #[test]
    fn fake_replays_script_then_defaults() {
        let fake = FakeAckManager::new();
        fake.push_get_tasks(Ok(sample_messages(&[5], true)));
        let cluster = ClusterName::new("c1").unwrap();
        let ctx = RequestContext::new();

        let first = fake.get_tasks(&ctx, &cluster, TaskId::new(4)).unwrap();
        assert!(first.has_more);
        let second = fake.get_tasks(&ctx, &cluster, TaskId::new(5)).unwrap();
        assert_eq!(second, ReplicationMessages::empty(TaskId::new(5)));
        assert_eq!(fake.get_tasks_calls().len(), 2);

        let err = fake.get_task(&ctx, &history_descriptor(9)).unwrap_err();
        assert_eq!(err.task_id(), Some(TaskId::new(9)));
    }
}

//! Durable, lightweight replication task records.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{NamespaceId, RunId, TaskId, WorkflowId};

/// Declared kind of a replication task.
///
/// `Unknown` preserves type codes written by a newer protocol version so the
/// hydrator can refuse them explicitly instead of dropping the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
pub enum TaskType {
    History,
    SyncActivity,
    Namespace,
    Unknown(u32),
}

impl TaskType {
    pub fn code(self) -> u32 {
        match self {
            TaskType::History => 1,
            TaskType::SyncActivity => 2,
            TaskType::Namespace => 3,
            TaskType::Unknown(raw) => raw,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => TaskType::History,
            2 => TaskType::SyncActivity,
            3 => TaskType::Namespace,
            raw => TaskType::Unknown(raw),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::History => "history",
            TaskType::SyncActivity => "sync_activity",
            TaskType::Namespace => "namespace",
            TaskType::Unknown(_) => "unknown",
        }
    }
}

impl From<TaskType> for u32 {
    fn from(value: TaskType) -> u32 {
        value.code()
    }
}

impl From<u32> for TaskType {
    fn from(value: u32) -> Self {
        TaskType::from_code(value)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Unknown(raw) => write!(f, "unknown({raw})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Per-type pointers needed to locate the payload of a task.
///
/// Fields that do not apply to a given task type are zero/empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingMetadata {
    pub version: i64,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub scheduled_event_id: i64,
    pub branch_token: Bytes,
    pub new_run_branch_token: Option<Bytes>,
    pub visibility_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    #[serde(default)]
    pub scheduling: SchedulingMetadata,
}

impl TaskDescriptor {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        run_id: RunId,
    ) -> Self {
        Self {
            task_id,
            task_type,
            namespace_id,
            workflow_id,
            run_id,
            scheduling: SchedulingMetadata::default(),
        }
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingMetadata) -> Self {
        self.scheduling = scheduling;
        self
    }
}

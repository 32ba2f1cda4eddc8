//! Persistence surfaces consumed by the ack manager.
//!
//! The task log and payload stores are owned by other parts of the shard; this
//! module only names what the replication path reads from them.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{
    ActivitySnapshot, DataBlob, ErrorCode, NamespaceId, NamespaceRecord, RunId, ShardId,
    TaskDescriptor, TaskId, Transience, WorkflowId,
};

/// One page of descriptors, ascending by task id.
///
/// `has_more` means the store stopped early (page limit or time budget) and
/// more descriptors may exist after the last one returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskLogPage {
    pub descriptors: Vec<TaskDescriptor>,
    pub has_more: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskLogError {
    #[error("task log unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("task log corrupt at {task_id:?}: {reason}")]
    Corrupt {
        task_id: Option<TaskId>,
        reason: String,
    },
}

impl TaskLogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TaskLogError::Unavailable { .. } => ErrorCode::Unavailable,
            TaskLogError::Corrupt { .. } => ErrorCode::Corruption,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            TaskLogError::Unavailable { .. } => Transience::Retryable,
            TaskLogError::Corrupt { .. } => Transience::Permanent,
        }
    }
}

/// Append-only descriptor log for one or more shards.
pub trait TaskLog: Send + Sync {
    /// Descriptors with id `> after`, at most `limit`, ascending.
    fn read_descriptors(
        &self,
        shard: ShardId,
        after: TaskId,
        limit: usize,
        time_budget: Duration,
    ) -> Result<TaskLogPage, TaskLogError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Removed by retention; the caller should resync by other means.
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("payload store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl PayloadError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PayloadError::NotFound { what: what.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        PayloadError::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Range of history events on one branch, `[first_event_id, next_event_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryRange {
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub branch_token: Bytes,
    pub first_event_id: i64,
    pub next_event_id: i64,
}

pub trait HistoryStore: Send + Sync {
    fn read_events(&self, range: &HistoryRange) -> Result<DataBlob, PayloadError>;

    /// First event batch of the run that continues on `branch_token`.
    fn read_first_batch(
        &self,
        namespace_id: NamespaceId,
        branch_token: &Bytes,
    ) -> Result<DataBlob, PayloadError>;
}

pub trait ActivityStore: Send + Sync {
    fn load_activity(
        &self,
        namespace_id: NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
        scheduled_event_id: i64,
    ) -> Result<ActivitySnapshot, PayloadError>;
}

pub trait NamespaceStore: Send + Sync {
    fn load_namespace(&self, namespace_id: NamespaceId) -> Result<NamespaceRecord, PayloadError>;
}

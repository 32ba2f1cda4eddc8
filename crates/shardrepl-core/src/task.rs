//! Hydrated replication tasks as delivered to remote clusters.
//!
//! A `ReplicationTask` is built per request from a `TaskDescriptor` and is
//! never stored on its own.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{NamespaceId, RunId, TaskId, WorkflowId};

/// Opaque encoded payload (history events, heartbeat details).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlob {
    pub encoding: String,
    pub data: Bytes,
}

impl DataBlob {
    pub fn new(encoding: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            encoding: encoding.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub task_id: TaskId,
    pub visibility_time_ms: u64,
    pub attributes: ReplicationTaskAttributes,
}

impl ReplicationTask {
    pub fn kind(&self) -> &'static str {
        match &self.attributes {
            ReplicationTaskAttributes::History(_) => "history",
            ReplicationTaskAttributes::SyncActivity(_) => "sync_activity",
            ReplicationTaskAttributes::Namespace(_) => "namespace",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationTaskAttributes {
    History(HistoryTaskAttributes),
    SyncActivity(SyncActivityTaskAttributes),
    Namespace(NamespaceTaskAttributes),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTaskAttributes {
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub version: i64,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub events: DataBlob,
    pub new_run_events: Option<DataBlob>,
}

/// Activity state as loaded from the workflow's mutable state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub version: i64,
    pub scheduled_event_id: i64,
    pub scheduled_time_ms: u64,
    pub started_event_id: i64,
    pub started_time_ms: Option<u64>,
    pub last_heartbeat_time_ms: Option<u64>,
    pub details: Option<DataBlob>,
    pub attempt: u32,
    pub last_failure: Option<String>,
    pub last_worker_identity: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActivityTaskAttributes {
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub activity: ActivitySnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceState {
    Registered,
    Deprecated,
    Deleted,
}

enum_str! {
    impl NamespaceState {
        pub fn as_str(&self) -> &'static str;
        pub fn parse_str(raw: &str) -> Option<Self>;
        variants {
            Registered => ["registered"],
            Deprecated => ["deprecated"],
            Deleted => ["deleted"],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub id: NamespaceId,
    pub name: String,
    pub state: NamespaceState,
    pub description: String,
    pub owner_email: String,
    pub retention_days: u32,
    pub config_version: i64,
    pub failover_version: i64,
    pub is_global: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceTaskAttributes {
    pub namespace: NamespaceRecord,
}

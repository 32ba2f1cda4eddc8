#![forbid(unsafe_code)]

//! Ack tracking and long-poll delivery of a shard's replication task log to
//! remote clusters.

pub use shardrepl_core as core;

pub mod config;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod repl;
pub mod telemetry;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    ClusterName, ErrorCode, ErrorPayload, Limits, NamespaceId, ReplicationMessages,
    ReplicationTask, RunId, ShardId, TaskDescriptor, TaskId, TaskType, WorkflowId,
};
pub use crate::repl::{
    AckManager, AckManagerConfig, AckManagerError, MeteredAckManager, ReplicationAckManager,
    ReplicationClient, ReplicationServer, RequestContext,
};

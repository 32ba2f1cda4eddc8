//! Domain types shared by the shard replication runtime and its adapters.

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod batch;
pub mod descriptor;
pub mod effect;
pub mod error;
pub mod ids;
pub mod limits;
pub mod messages;
pub mod task;

pub use batch::{OrderedBatch, OrderedBatchError};
pub use descriptor::{SchedulingMetadata, TaskDescriptor, TaskType};
pub use effect::{Effect, Transience};
pub use error::{CoreError, ErrorCode, ErrorPayload, InvalidId};
pub use ids::{ClusterName, NamespaceId, RunId, ShardId, TaskId, WorkflowId};
pub use limits::{Limits, LimitsError};
pub use messages::ReplicationMessages;
pub use task::{
    ActivitySnapshot, DataBlob, HistoryTaskAttributes, NamespaceRecord, NamespaceState,
    NamespaceTaskAttributes, ReplicationTask, ReplicationTaskAttributes,
    SyncActivityTaskAttributes,
};

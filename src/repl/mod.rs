//! Shard replication: ack tracking, long-poll delivery and the wire surface.

pub mod ack_manager;
pub mod cancel;
pub mod client;
pub mod frame;
pub mod hydrator;
pub mod lifecycle;
pub mod metered;
pub mod proto;
pub mod reader;
pub mod server;
pub mod store;
pub mod watch;

pub use ack_manager::{AckManager, AckManagerConfig, AckManagerError, ReplicationAckManager};
pub use cancel::{CancelLink, CancelListener, CancelRegistration, CancelToken, RequestContext};
pub use client::{ClientError, ReplicationClient};
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use hydrator::{
    HydrateError, HydratedPrefix, StoreHydrator, TaskHydrator, hydrate_all, hydrate_until,
};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use metered::MeteredAckManager;
pub use proto::{
    GetMessages, GetTask, ProtoDecodeError, ProtoEncodeError, ReplEnvelope, ReplMessage,
    decode_envelope, encode_envelope,
};
pub use reader::{ReadError, ReadOutcome, TaskReader};
pub use server::{ReplicationServer, ReplicationServerConfig, ReplicationServerHandle, ServerError};
pub use store::{
    ActivityStore, HistoryRange, HistoryStore, NamespaceStore, PayloadError, TaskLog,
    TaskLogError, TaskLogPage,
};
pub use watch::{MaxTaskWatch, WaitOutcome};

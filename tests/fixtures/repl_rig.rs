use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use shardrepl::core::{ClusterName, Limits, ReplicationMessages, ShardId, TaskId};
use shardrepl::repl::{
    AckManagerConfig, ReplicationClient, ReplicationServer, ReplicationServerConfig,
    ReplicationServerHandle,
};
use shardrepl::test_harness::MemoryShard;

pub const SHARD: ShardId = ShardId::new(7);

pub fn cluster(name: &str) -> ClusterName {
    ClusterName::new(name).expect("cluster name")
}

pub fn short_poll(batch: usize) -> AckManagerConfig {
    AckManagerConfig {
        max_batch_tasks: batch,
        long_poll_timeout: Duration::from_millis(100),
        ..AckManagerConfig::default()
    }
}

pub fn ids(messages: &ReplicationMessages) -> Vec<u64> {
    messages.task_ids().map(TaskId::get).collect()
}

/// A memory-backed shard served over loopback TCP.
pub struct ReplRig {
    pub shard: MemoryShard,
    handle: Option<ReplicationServerHandle>,
}

impl ReplRig {
    pub fn start(config: AckManagerConfig, max_connections: usize) -> Self {
        let shard = MemoryShard::start(SHARD, config);
        let server = ReplicationServer::new(
            Arc::clone(&shard.manager),
            ReplicationServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                limits: Limits::default(),
                max_connections: NonZeroUsize::new(max_connections).expect("nonzero"),
            },
        );
        let handle = server.start().expect("start replication server");
        Self {
            shard,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.as_ref().expect("server running").local_addr()
    }

    pub fn client(&self) -> ReplicationClient {
        ReplicationClient::connect(self.addr(), Limits::default()).expect("connect")
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

impl Drop for ReplRig {
    fn drop(&mut self) {
        self.shutdown();
    }
}

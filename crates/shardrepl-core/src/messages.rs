//! Response envelope for a replication poll.

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;
use crate::task::ReplicationTask;

/// Ordered batch handed to a polling cluster.
///
/// `last_retrieved_message_id` is the exact cursor the caller presents on its
/// next poll, after it has durably applied `tasks`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMessages {
    pub tasks: Vec<ReplicationTask>,
    pub last_retrieved_message_id: TaskId,
    pub has_more: bool,
}

impl ReplicationMessages {
    /// Nothing new above `cursor`; the caller keeps its position.
    pub fn empty(cursor: TaskId) -> Self {
        Self {
            tasks: Vec::new(),
            last_retrieved_message_id: cursor,
            has_more: false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.iter().map(|task| task.task_id)
    }
}

//! Bounded paging over a shard's task log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::{
    ErrorCode, OrderedBatch, OrderedBatchError, ShardId, TaskDescriptor, TaskId, Transience,
};

use super::store::{TaskLog, TaskLogError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error(transparent)]
    Log(#[from] TaskLogError),
    #[error("task log returned out-of-order descriptors: {0}")]
    OutOfOrder(#[from] OrderedBatchError),
}

impl ReadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ReadError::Log(err) => err.code(),
            ReadError::OutOfOrder(_) => ErrorCode::Corruption,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ReadError::Log(err) => err.transience(),
            ReadError::OutOfOrder(_) => Transience::Permanent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub batch: OrderedBatch,
    /// The range `(after, up_to]` was not fully scanned.
    pub has_more: bool,
}

/// Reads `(after, up_to]` page by page until a count or time bound is hit.
#[derive(Clone)]
pub struct TaskReader {
    shard: ShardId,
    log: Arc<dyn TaskLog>,
}

impl TaskReader {
    pub fn new(shard: ShardId, log: Arc<dyn TaskLog>) -> Self {
        Self { shard, log }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn read(
        &self,
        after: TaskId,
        up_to: TaskId,
        max_tasks: usize,
        budget: Duration,
    ) -> Result<ReadOutcome, ReadError> {
        let started = Instant::now();
        let mut batch = OrderedBatch::empty(after);
        if after >= up_to {
            return Ok(ReadOutcome {
                batch,
                has_more: false,
            });
        }

        loop {
            if batch.len() >= max_tasks {
                return Ok(ReadOutcome {
                    batch,
                    has_more: true,
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= budget {
                tracing::debug!(
                    shard = %self.shard,
                    after = %after,
                    cursor = %batch.cursor(),
                    "read budget exhausted"
                );
                return Ok(ReadOutcome {
                    batch,
                    has_more: true,
                });
            }

            let want = max_tasks - batch.len();
            let page = self
                .log
                .read_descriptors(self.shard, batch.cursor(), want, budget - elapsed)?;
            let (descriptors, reached_end) = clip_page(page.descriptors, up_to, want);
            let page_len = descriptors.len();
            batch.extend(descriptors)?;

            if reached_end || !page.has_more || batch.cursor() >= up_to {
                return Ok(ReadOutcome {
                    batch,
                    has_more: false,
                });
            }
            if page_len == 0 {
                // Store ran out of its own budget before producing anything.
                return Ok(ReadOutcome {
                    batch,
                    has_more: true,
                });
            }
        }
    }
}

/// Drops descriptors above `up_to` and anything past `want`.
///
/// Returns whether the page crossed `up_to`, i.e. the range is exhausted.
fn clip_page(
    mut descriptors: Vec<TaskDescriptor>,
    up_to: TaskId,
    want: usize,
) -> (Vec<TaskDescriptor>, bool) {
    let mut reached_end = false;
    if let Some(pos) = descriptors.iter().position(|d| d.task_id > up_to) {
        descriptors.truncate(pos);
        reached_end = true;
    }
    if descriptors.len() > want {
        descriptors.truncate(want);
        reached_end = false;
    }
    (descriptors, reached_end)
}

//! Ordered descriptor run with verified ordering invariants.

use crate::descriptor::TaskDescriptor;
use crate::ids::TaskId;

/// Descriptors strictly above `after`, strictly ascending by task id.
///
/// Gaps between ids are allowed (tombstoned or cancelled tasks); duplicates
/// and regressions are not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderedBatch {
    after: TaskId,
    descriptors: Vec<TaskDescriptor>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum OrderedBatchError {
    #[error("task {got} is not above the lower bound {after}")]
    AtOrBelowBound { after: TaskId, got: TaskId },
    #[error("task ids not strictly ascending (prev {prev}, got {got})")]
    NotAscending { prev: TaskId, got: TaskId },
}

impl OrderedBatch {
    pub fn empty(after: TaskId) -> Self {
        Self {
            after,
            descriptors: Vec::new(),
        }
    }

    pub fn try_new(
        after: TaskId,
        descriptors: Vec<TaskDescriptor>,
    ) -> Result<Self, OrderedBatchError> {
        let mut prev: Option<TaskId> = None;
        for descriptor in &descriptors {
            let got = descriptor.task_id;
            match prev {
                None if got <= after => {
                    return Err(OrderedBatchError::AtOrBelowBound { after, got });
                }
                Some(prev) if got <= prev => {
                    return Err(OrderedBatchError::NotAscending { prev, got });
                }
                _ => {}
            }
            prev = Some(got);
        }
        Ok(Self { after, descriptors })
    }

    /// Appends a page read after this batch's current end.
    pub fn extend(&mut self, page: Vec<TaskDescriptor>) -> Result<(), OrderedBatchError> {
        let next = OrderedBatch::try_new(self.cursor(), page)?;
        self.descriptors.extend(next.descriptors);
        Ok(())
    }

    pub fn after(&self) -> TaskId {
        self.after
    }

    /// Last id in the batch, or the lower bound when empty.
    pub fn cursor(&self) -> TaskId {
        self.descriptors
            .last()
            .map(|descriptor| descriptor.task_id)
            .unwrap_or(self.after)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[TaskDescriptor] {
        &self.descriptors
    }

    pub fn into_descriptors(self) -> Vec<TaskDescriptor> {
        self.descriptors
    }
}

//! Expands task descriptors into the payloads remote clusters apply.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::core::{
    ErrorCode, ErrorPayload, HistoryTaskAttributes, NamespaceTaskAttributes, ReplicationTask,
    ReplicationTaskAttributes, SyncActivityTaskAttributes, TaskDescriptor, TaskId, TaskType,
    Transience,
};

use super::store::{ActivityStore, HistoryRange, HistoryStore, NamespaceStore, PayloadError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HydrateError {
    #[error("task {task_id}: unsupported task type {task_type}")]
    UnsupportedTaskType { task_id: TaskId, task_type: TaskType },
    #[error("task {task_id}: {what} not found")]
    NotFound { task_id: TaskId, what: String },
    #[error("task {task_id}: payload unavailable: {reason}")]
    Unavailable { task_id: TaskId, reason: String },
}

impl HydrateError {
    fn from_payload(task_id: TaskId, err: PayloadError) -> Self {
        match err {
            PayloadError::NotFound { what } => HydrateError::NotFound { task_id, what },
            PayloadError::Unavailable { reason } => HydrateError::Unavailable { task_id, reason },
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            HydrateError::UnsupportedTaskType { task_id, .. }
            | HydrateError::NotFound { task_id, .. }
            | HydrateError::Unavailable { task_id, .. } => *task_id,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            HydrateError::UnsupportedTaskType { .. } => ErrorCode::UnsupportedTaskType,
            HydrateError::NotFound { .. } => ErrorCode::NotFound,
            HydrateError::Unavailable { .. } => ErrorCode::Unavailable,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            HydrateError::Unavailable { .. } => Transience::Retryable,
            HydrateError::UnsupportedTaskType { .. } | HydrateError::NotFound { .. } => {
                Transience::Permanent
            }
        }
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string(), self.transience().is_retryable())
            .with_task_id(self.task_id())
    }
}

pub trait TaskHydrator: Send + Sync {
    fn hydrate(&self, descriptor: &TaskDescriptor) -> Result<ReplicationTask, HydrateError>;
}

/// Hydrates every descriptor in order, failing on the first error.
pub fn hydrate_all(
    hydrator: &dyn TaskHydrator,
    descriptors: &[TaskDescriptor],
) -> Result<Vec<ReplicationTask>, HydrateError> {
    descriptors
        .iter()
        .map(|descriptor| hydrator.hydrate(descriptor))
        .collect()
}

/// Tasks hydrated from the front of a descriptor run.
#[derive(Debug)]
pub struct HydratedPrefix {
    pub tasks: Vec<ReplicationTask>,
    /// Every descriptor was hydrated.
    pub complete: bool,
}

/// Hydrates in order until `deadline` passes.
///
/// The first descriptor is always attempted so a slow store still lets each
/// call make progress. Stopping early keeps a gap-free prefix.
pub fn hydrate_until(
    hydrator: &dyn TaskHydrator,
    descriptors: &[TaskDescriptor],
    deadline: Instant,
) -> Result<HydratedPrefix, HydrateError> {
    let mut tasks = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !tasks.is_empty() && Instant::now() >= deadline {
            tracing::debug!(
                hydrated = tasks.len(),
                remaining = descriptors.len() - tasks.len(),
                "hydration budget exhausted"
            );
            return Ok(HydratedPrefix {
                tasks,
                complete: false,
            });
        }
        tasks.push(hydrator.hydrate(descriptor)?);
    }
    Ok(HydratedPrefix {
        tasks,
        complete: true,
    })
}

/// Production hydrator backed by the shard's payload stores.
#[derive(Clone)]
pub struct StoreHydrator {
    history: Arc<dyn HistoryStore>,
    activity: Arc<dyn ActivityStore>,
    namespaces: Arc<dyn NamespaceStore>,
}

impl StoreHydrator {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        activity: Arc<dyn ActivityStore>,
        namespaces: Arc<dyn NamespaceStore>,
    ) -> Self {
        Self {
            history,
            activity,
            namespaces,
        }
    }

    fn history(&self, descriptor: &TaskDescriptor) -> Result<ReplicationTaskAttributes, PayloadError> {
        let scheduling = &descriptor.scheduling;
        let range = HistoryRange {
            namespace_id: descriptor.namespace_id,
            workflow_id: descriptor.workflow_id.clone(),
            run_id: descriptor.run_id,
            branch_token: scheduling.branch_token.clone(),
            first_event_id: scheduling.first_event_id,
            next_event_id: scheduling.next_event_id,
        };
        let events = self.history.read_events(&range)?;
        let new_run_events = match &scheduling.new_run_branch_token {
            Some(token) => Some(
                self.history
                    .read_first_batch(descriptor.namespace_id, token)?,
            ),
            None => None,
        };
        Ok(ReplicationTaskAttributes::History(HistoryTaskAttributes {
            namespace_id: descriptor.namespace_id,
            workflow_id: descriptor.workflow_id.clone(),
            run_id: descriptor.run_id,
            version: scheduling.version,
            first_event_id: scheduling.first_event_id,
            next_event_id: scheduling.next_event_id,
            events,
            new_run_events,
        }))
    }

    fn sync_activity(
        &self,
        descriptor: &TaskDescriptor,
    ) -> Result<ReplicationTaskAttributes, PayloadError> {
        let activity = self.activity.load_activity(
            descriptor.namespace_id,
            &descriptor.workflow_id,
            descriptor.run_id,
            descriptor.scheduling.scheduled_event_id,
        )?;
        Ok(ReplicationTaskAttributes::SyncActivity(
            SyncActivityTaskAttributes {
                namespace_id: descriptor.namespace_id,
                workflow_id: descriptor.workflow_id.clone(),
                run_id: descriptor.run_id,
                activity,
            },
        ))
    }

    fn namespace(
        &self,
        descriptor: &TaskDescriptor,
    ) -> Result<ReplicationTaskAttributes, PayloadError> {
        let namespace = self.namespaces.load_namespace(descriptor.namespace_id)?;
        Ok(ReplicationTaskAttributes::Namespace(
            NamespaceTaskAttributes { namespace },
        ))
    }
}

impl TaskHydrator for StoreHydrator {
    fn hydrate(&self, descriptor: &TaskDescriptor) -> Result<ReplicationTask, HydrateError> {
        let task_id = descriptor.task_id;
        let attributes = match descriptor.task_type {
            TaskType::History => self.history(descriptor),
            TaskType::SyncActivity => self.sync_activity(descriptor),
            TaskType::Namespace => self.namespace(descriptor),
            task_type @ TaskType::Unknown(_) => {
                tracing::warn!(task_id = %task_id, %task_type, "refusing to hydrate unknown task type");
                return Err(HydrateError::UnsupportedTaskType { task_id, task_type });
            }
        }
        .map_err(|err| HydrateError::from_payload(task_id, err))?;

        Ok(ReplicationTask {
            task_id,
            visibility_time_ms: descriptor.scheduling.visibility_time_ms,
            attributes,
        })
    }
}

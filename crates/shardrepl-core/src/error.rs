//! Core capability errors and the wire-stable error vocabulary.
//!
//! Error codes are part of the replication wire contract: remote clusters
//! branch on them (resync on `not_found`, retry on `unavailable`), so the
//! string forms must never change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::effect::{Effect, Transience};
use crate::ids::TaskId;

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("cluster name `{raw}` is invalid: {reason}")]
    ClusterName { raw: String, reason: String },
    #[error("workflow id `{raw}` is invalid: {reason}")]
    WorkflowId { raw: String, reason: String },
    #[error("namespace id `{raw}` is invalid: {reason}")]
    NamespaceId { raw: String, reason: String },
    #[error("run id `{raw}` is invalid: {reason}")]
    RunId { raw: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidRequest
    }

    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Unavailable,
    UnsupportedTaskType,
    Cancelled,
    ShuttingDown,
    InvalidRequest,
    Corruption,
    FrameTooLarge,
    Overloaded,
    Internal,
}

enum_str! {
    impl ErrorCode {
        pub fn as_str(&self) -> &'static str;
        pub fn parse_str(raw: &str) -> Option<Self>;
        variants {
            NotFound => ["not_found"],
            Unavailable => ["unavailable"],
            UnsupportedTaskType => ["unsupported_task_type"],
            Cancelled => ["cancelled", "canceled"],
            ShuttingDown => ["shutting_down"],
            InvalidRequest => ["invalid_request"],
            Corruption => ["corruption"],
            FrameTooLarge => ["frame_too_large"],
            Overloaded => ["overloaded"],
            Internal => ["internal"],
        }
    }
}

/// Error as carried on the wire back to a polling cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(task_id) = self.task_id {
            write!(f, " (task {task_id})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::NotFound.as_str(), "not_found");
        assert_eq!(ErrorCode::UnsupportedTaskType.as_str(), "unsupported_task_type");
        assert_eq!(ErrorCode::parse_str("canceled"), Some(ErrorCode::Cancelled));
        assert_eq!(ErrorCode::parse_str("nope"), None);
    }

    #[test]
    fn error_code_serde_matches_as_str() {
        let json = serde_json::to_string(&ErrorCode::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting_down\"");
    }

    #[test]
    fn payload_display_includes_task() {
        let payload = ErrorPayload::new(ErrorCode::NotFound, "history gone", false)
            .with_task_id(TaskId::new(42));
        assert_eq!(payload.to_string(), "not_found: history gone (task 42)");
    }
}

//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, InvalidId};

const MAX_CLUSTER_NAME_LEN: usize = 255;
const MAX_WORKFLOW_ID_LEN: usize = 1000;

/// Position in a shard's replication log.
///
/// Identifiers are allocated strictly increasing per shard. `TaskId::ZERO`
/// precedes every real task and is the cursor of a cluster that has applied
/// nothing yet.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const ZERO: TaskId = TaskId(0);
    pub const MAX: TaskId = TaskId(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn saturating_next(self) -> TaskId {
        TaskId(self.0.saturating_add(1))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> u64 {
        value.0
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u32);

impl ShardId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(Uuid);

impl NamespaceId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse_str(raw: &str) -> Result<Self, CoreError> {
        parse_uuid(raw)
            .map(Self)
            .map_err(|reason| InvalidId::NamespaceId {
                raw: raw.to_string(),
                reason,
            })
            .map_err(CoreError::from)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceId({})", self.0)
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse_str(raw: &str) -> Result<Self, CoreError> {
        parse_uuid(raw)
            .map(Self)
            .map_err(|reason| InvalidId::RunId {
                raw: raw.to_string(),
                reason,
            })
            .map_err(CoreError::from)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidId::WorkflowId {
                raw,
                reason: "must not be empty".into(),
            }
            .into());
        }
        if raw.len() > MAX_WORKFLOW_ID_LEN {
            return Err(InvalidId::WorkflowId {
                raw,
                reason: format!("longer than {MAX_WORKFLOW_ID_LEN} bytes"),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkflowId({:?})", self.0)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkflowId {
    type Error = CoreError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        WorkflowId::new(raw)
    }
}

impl From<WorkflowId> for String {
    fn from(value: WorkflowId) -> String {
        value.0
    }
}

/// Name of a remote cluster polling this shard.
///
/// Used for attribution (logs, metrics) only; it grants no visibility.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterName(String);

impl ClusterName {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::ClusterName {
                raw,
                reason: "must not be empty".into(),
            }
            .into());
        }
        if raw.len() > MAX_CLUSTER_NAME_LEN {
            return Err(InvalidId::ClusterName {
                raw,
                reason: format!("longer than {MAX_CLUSTER_NAME_LEN} bytes"),
            }
            .into());
        }
        let invalid = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')));
        if let Some(bad) = invalid {
            return Err(InvalidId::ClusterName {
                reason: format!("contains invalid character {bad:?}"),
                raw,
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterName({})", self.0)
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClusterName {
    type Error = CoreError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        ClusterName::new(raw)
    }
}

impl From<ClusterName> for String {
    fn from(value: ClusterName) -> String {
        value.0
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_orders_numerically() {
        assert!(TaskId::new(9) < TaskId::new(10));
        assert_eq!(TaskId::ZERO.saturating_next(), TaskId::new(1));
        assert_eq!(TaskId::MAX.saturating_next(), TaskId::MAX);
    }

    #[test]
    fn cluster_name_rejects_bad_input() {
        assert!(ClusterName::new("cluster-a.us_east").is_ok());
        assert!(ClusterName::new("").is_err());
        assert!(ClusterName::new("a b").is_err());
        assert!(ClusterName::new("x".repeat(256)).is_err());
    }

    #[test]
    fn workflow_id_rejects_blank() {
        assert!(WorkflowId::new("   ").is_err());
        assert_eq!(WorkflowId::new("order-17").unwrap().as_str(), "order-17");
    }

    #[test]
    fn cluster_name_deserialize_validates() {
        let err = serde_json::from_str::<ClusterName>("\"bad name\"");
        assert!(err.is_err());
        let ok: ClusterName = serde_json::from_str("\"standby\"").unwrap();
        assert_eq!(ok.as_str(), "standby");
    }
}

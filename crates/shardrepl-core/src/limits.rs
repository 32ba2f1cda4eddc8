//! Delivery and decode limits.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to replication polling and the wire codec.
///
/// Durations carry their unit in the field name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_batch_tasks: usize,
    pub max_read_duration_ms: u64,
    pub long_poll_timeout_ms: u64,
    pub max_request_wait_ms: u64,

    pub max_frame_bytes: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_bytes_string_len: usize,
    pub max_cbor_text_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_batch_tasks: 100,
            max_read_duration_ms: 5_000,
            long_poll_timeout_ms: 20_000,
            max_request_wait_ms: 60_000,

            max_frame_bytes: 16 * 1024 * 1024,

            max_cbor_depth: 16,
            max_cbor_map_entries: 64,
            max_cbor_array_entries: 100_000,
            max_cbor_bytes_string_len: 16 * 1024 * 1024,
            max_cbor_text_string_len: 64 * 1024,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("limit {field} is invalid: {reason}")]
pub struct LimitsError {
    pub field: &'static str,
    pub reason: String,
}

impl Limits {
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.max_batch_tasks == 0 {
            return Err(LimitsError {
                field: "max_batch_tasks",
                reason: "must be > 0".into(),
            });
        }
        if self.max_read_duration_ms == 0 {
            return Err(LimitsError {
                field: "max_read_duration_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(LimitsError {
                field: "max_frame_bytes",
                reason: "must be > 0".into(),
            });
        }
        if self.max_batch_tasks > self.max_cbor_array_entries {
            return Err(LimitsError {
                field: "max_batch_tasks",
                reason: format!(
                    "exceeds max_cbor_array_entries ({})",
                    self.max_cbor_array_entries
                ),
            });
        }
        Ok(())
    }
}

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{Limits, ShardId};
use crate::repl::{AckManagerConfig, ReplicationServerConfig};

use super::ConfigError;

/// Copies each `Some` override field onto the same-named target field.
macro_rules! overlay {
    ($src:expr => $dst:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$src.$field {
                $dst.$field = value.clone();
            }
        )+
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub limits: Limits,
    pub replication: ReplicationConfig,
}

impl Config {
    pub fn ack_manager_config(&self) -> Result<AckManagerConfig, ConfigError> {
        AckManagerConfig::from_limits(&self.limits).map_err(|err| ConfigError::Invalid {
            field: err.field,
            reason: err.reason,
        })
    }

    pub fn server_config(&self) -> Result<ReplicationServerConfig, ConfigError> {
        self.limits.validate().map_err(|err| ConfigError::Invalid {
            field: err.field,
            reason: err.reason,
        })?;
        let max_connections =
            NonZeroUsize::new(self.replication.max_connections).ok_or_else(|| {
                ConfigError::Invalid {
                    field: "replication.max_connections",
                    reason: "must be greater than zero".into(),
                }
            })?;
        Ok(ReplicationServerConfig {
            listen_addr: self.replication.listen_addr.clone(),
            limits: self.limits.clone(),
            max_connections,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        overlay!(self => target; stdout, stdout_format);
        if self.filter.is_some() {
            target.filter.clone_from(&self.filter);
        }
        if let Some(file) = &self.file {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        overlay!(self => target; enabled, format, rotation);
        if self.dir.is_some() {
            target.dir.clone_from(&self.dir);
        }
    }
}

/// One partially specified config source (user file, explicit file).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub logging: LoggingConfigOverride,
    pub limits: LimitsOverride,
    pub replication: ReplicationConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.logging.apply_to(&mut base.logging);
        self.limits.apply_to(&mut base.limits);
        self.replication.apply_to(&mut base.replication);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_batch_tasks: Option<usize>,
    pub max_read_duration_ms: Option<u64>,
    pub long_poll_timeout_ms: Option<u64>,
    pub max_request_wait_ms: Option<u64>,

    pub max_frame_bytes: Option<usize>,

    pub max_cbor_depth: Option<usize>,
    pub max_cbor_map_entries: Option<usize>,
    pub max_cbor_array_entries: Option<usize>,
    pub max_cbor_bytes_string_len: Option<usize>,
    pub max_cbor_text_string_len: Option<usize>,
}

impl LimitsOverride {
    pub fn apply_to(&self, limits: &mut Limits) {
        overlay!(self => limits;
            max_batch_tasks,
            max_read_duration_ms,
            long_poll_timeout_ms,
            max_request_wait_ms,
            max_frame_bytes,
            max_cbor_depth,
            max_cbor_map_entries,
            max_cbor_array_entries,
            max_cbor_bytes_string_len,
            max_cbor_text_string_len,
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub listen_addr: String,
    pub shard_id: u32,
    pub max_connections: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7233".to_string(),
            shard_id: 1,
            max_connections: 32,
        }
    }
}

impl ReplicationConfig {
    pub fn shard(&self) -> ShardId {
        ShardId::new(self.shard_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplicationConfigOverride {
    pub listen_addr: Option<String>,
    pub shard_id: Option<u32>,
    pub max_connections: Option<usize>,
}

impl ReplicationConfigOverride {
    pub fn apply_to(&self, replication: &mut ReplicationConfig) {
        overlay!(self => replication; listen_addr, shard_id, max_connections);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn partial_layer_only_touches_named_fields() {
        let layer: ConfigLayer = toml::from_str(
            r#"
            [limits]
            max_batch_tasks = 25

            [replication]
            shard_id = 9
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        layer.apply_to(&mut config);
        assert_eq!(config.limits.max_batch_tasks, 25);
        assert_eq!(
            config.limits.long_poll_timeout_ms,
            Limits::default().long_poll_timeout_ms
        );
        assert_eq!(config.replication.shard(), ShardId::new(9));
        assert_eq!(config.replication.listen_addr, "127.0.0.1:7233");
        assert!(config.logging.stdout);
    }

    #[test]
    fn derives_runtime_configs() {
        let mut config = Config::default();
        config.limits.long_poll_timeout_ms = 1_500;
        let ack = config.ack_manager_config().unwrap();
        assert_eq!(ack.long_poll_timeout, Duration::from_millis(1_500));
        assert_eq!(ack.max_batch_tasks, 100);

        let server = config.server_config().unwrap();
        assert_eq!(server.max_connections.get(), 32);
    }

    #[test]
    fn rejects_invalid_runtime_values() {
        let mut config = Config::default();
        config.limits.max_batch_tasks = 0;
        assert!(matches!(
            config.ack_manager_config(),
            Err(ConfigError::Invalid {
                field: "max_batch_tasks",
                ..
            })
        ));

        let mut config = Config::default();
        config.replication.max_connections = 0;
        assert!(matches!(
            config.server_config(),
            Err(ConfigError::Invalid {
                field: "replication.max_connections",
                ..
            })
        ));
    }
}

//! Config loading and persistence.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::{ErrorCode, Transience};

mod load;
mod merge;
mod schema;

pub use load::{config_path, load, load_layer, load_user_config, load_with, write_config};
pub use merge::{apply_env_overrides, apply_overrides_from, merge_layers};
pub use schema::{
    Config, ConfigLayer, FileLoggingConfig, FileLoggingConfigOverride, LimitsOverride, LogFormat,
    LogRotation, LoggingConfig, LoggingConfigOverride, ReplicationConfig,
    ReplicationConfigOverride,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => ErrorCode::Unavailable,
            ConfigError::Parse { .. } | ConfigError::Invalid { .. } => ErrorCode::InvalidRequest,
            ConfigError::Render(_) => ErrorCode::Internal,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }
}

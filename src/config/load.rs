use std::fs;
use std::path::Path;

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigError, ConfigLayer};

pub fn config_path() -> std::path::PathBuf {
    crate::paths::config_path()
}

/// Reads one layer; a missing file is not an error.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_user_config() -> Result<Option<ConfigLayer>, ConfigError> {
    load_layer(&config_path())
}

/// Defaults, then the user file, then environment overrides.
pub fn load() -> Result<Config, ConfigError> {
    load_with(None)
}

/// Like [`load`], with an explicit file layered above the user file.
///
/// Unlike the user file, an explicit file must exist.
pub fn load_with(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_user_config()?;
    let explicit = match explicit {
        Some(path) => Some(load_layer(path)?.ok_or_else(|| ConfigError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        })?),
        None => None,
    };
    let mut config = merge_layers(user, explicit);
    apply_env_overrides(&mut config);
    tracing::debug!(
        listen_addr = %config.replication.listen_addr,
        shard = config.replication.shard_id,
        "config loaded"
    );
    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let contents = toml::to_string_pretty(cfg)?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Invalid {
        field: "path",
        reason: format!("{} has no parent directory", path.display()),
    })?;
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), data).map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig, ReplicationConfig};
    use crate::core::Limits;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            logging: LoggingConfig {
                stdout: false,
                stdout_format: LogFormat::Compact,
                filter: Some("shardrepl=debug".into()),
                file: FileLoggingConfig {
                    enabled: true,
                    dir: Some(PathBuf::from("/tmp/shardrepl-test-logs")),
                    format: LogFormat::Json,
                    rotation: LogRotation::Hourly,
                },
            },
            limits: Limits {
                max_batch_tasks: 7,
                ..Limits::default()
            },
            replication: ReplicationConfig {
                listen_addr: "127.0.0.1:9999".to_string(),
                shard_id: 12,
                max_connections: 3,
            },
        };
        write_config(&path, &cfg).expect("write config");

        let layer = load_layer(&path).expect("load").expect("present");
        let loaded = merge_layers(Some(layer), None);
        assert!(!loaded.logging.stdout);
        assert_eq!(loaded.logging.stdout_format, LogFormat::Compact);
        assert_eq!(loaded.logging.filter.as_deref(), Some("shardrepl=debug"));
        assert!(loaded.logging.file.enabled);
        assert_eq!(loaded.logging.file.rotation, LogRotation::Hourly);
        assert_eq!(loaded.limits.max_batch_tasks, 7);
        assert_eq!(loaded.replication.shard_id, 12);
        assert_eq!(loaded.replication.max_connections, 3);
    }

    #[test]
    fn missing_layer_is_none_and_bad_toml_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_layer(&dir.path().join("absent.toml")).unwrap().is_none());

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[replication\nlisten_addr = 1").unwrap();
        assert!(matches!(
            load_layer(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_file_layers_over_defaults() {
        let _dirs = crate::paths::set_dir_for_tests_guard();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("explicit.toml");
        fs::write(&path, "[replication]\nmax_connections = 4\n").unwrap();

        let config = load_with(Some(&path)).unwrap();
        assert_eq!(config.replication.max_connections, 4);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            load_with(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }
}

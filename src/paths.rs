//! XDG directory helpers for config and log locations.

use std::path::PathBuf;

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const APP_DIR: &str = "shardrepl";

/// Base directory for configuration files.
///
/// Uses `SHARDREPL_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/shardrepl`
/// or `~/.config/shardrepl`.
pub fn config_dir() -> PathBuf {
    #[cfg(test)]
    if let Some(dir) = test_dir_override() {
        return dir.join("config");
    }

    if let Ok(dir) = std::env::var("SHARDREPL_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    xdg_base("XDG_CONFIG_HOME", &[".config"]).join(APP_DIR)
}

/// Default config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Directory for rotated log files.
///
/// Uses `SHARDREPL_LOG_DIR` if set, otherwise `$XDG_STATE_HOME/shardrepl/logs`
/// or `~/.local/state/shardrepl/logs`.
pub fn log_dir() -> PathBuf {
    #[cfg(test)]
    if let Some(dir) = test_dir_override() {
        return dir.join("logs");
    }

    if let Ok(dir) = std::env::var("SHARDREPL_LOG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    xdg_base("XDG_STATE_HOME", &[".local", "state"])
        .join(APP_DIR)
        .join("logs")
}

fn xdg_base(var: &str, home_fallback: &[&str]) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
            for part in home_fallback {
                path.push(part);
            }
            path
        })
}

#[cfg(test)]
static TEST_DIR: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

#[cfg(test)]
fn test_dir_override() -> Option<PathBuf> {
    TEST_DIR
        .get_or_init(|| Mutex::new(None))
        .lock()
        .expect("test dir lock poisoned")
        .clone()
}

#[cfg(test)]
fn set_dir_for_tests(path: Option<PathBuf>) {
    *TEST_DIR
        .get_or_init(|| Mutex::new(None))
        .lock()
        .expect("test dir lock poisoned") = path;
}

/// Points config and log dirs at a fresh temp dir until dropped.
#[cfg(test)]
pub(crate) struct TestDirGuard {
    _lock: std::sync::MutexGuard<'static, ()>,
    dir: tempfile::TempDir,
}

#[cfg(test)]
impl TestDirGuard {
    pub(crate) fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

#[cfg(test)]
impl Drop for TestDirGuard {
    fn drop(&mut self) {
        set_dir_for_tests(None);
    }
}

#[cfg(test)]
pub(crate) fn set_dir_for_tests_guard() -> TestDirGuard {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let lock = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempfile::TempDir::new().expect("temp dir");
    set_dir_for_tests(Some(dir.path().to_path_buf()));
    TestDirGuard { _lock: lock, dir }
}

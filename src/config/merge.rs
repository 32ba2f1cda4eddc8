use std::str::FromStr;

use super::{Config, ConfigLayer};

/// Applies layers in order; later layers win.
pub fn merge_layers(user: Option<ConfigLayer>, explicit: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = explicit {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Applies `SHARDREPL_*` overrides read through `lookup`.
pub fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = env_value(&lookup, "SHARDREPL_LISTEN_ADDR") {
        config.replication.listen_addr = raw;
    }
    if let Some(value) = parse_env::<usize>(&lookup, "SHARDREPL_MAX_CONNECTIONS") {
        config.replication.max_connections = value;
    }
    if let Some(value) = parse_env::<u64>(&lookup, "SHARDREPL_LONG_POLL_TIMEOUT_MS") {
        config.limits.long_poll_timeout_ms = value;
    }
    if let Some(value) = parse_env::<usize>(&lookup, "SHARDREPL_MAX_BATCH_TASKS") {
        config.limits.max_batch_tasks = value;
    }
}

fn env_value(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_value(lookup, key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::config::LogFormat;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn merge_layers_respects_precedence() {
        let mut user = ConfigLayer::default();
        user.replication.listen_addr = Some("0.0.0.0:1000".into());
        user.logging.stdout_format = Some(LogFormat::Json);

        let mut explicit = ConfigLayer::default();
        explicit.replication.listen_addr = Some("0.0.0.0:2000".into());

        let config = merge_layers(Some(user), Some(explicit));
        assert_eq!(config.replication.listen_addr, "0.0.0.0:2000");
        assert_eq!(config.logging.stdout_format, LogFormat::Json);
    }

    #[test]
    fn env_overrides_apply() {
        let lookup = vars(&[
            ("SHARDREPL_LISTEN_ADDR", "127.0.0.1:9999"),
            ("SHARDREPL_MAX_CONNECTIONS", "12"),
            ("SHARDREPL_LONG_POLL_TIMEOUT_MS", "750"),
            ("SHARDREPL_MAX_BATCH_TASKS", "40"),
        ]);

        let mut config = Config::default();
        apply_overrides_from(&mut config, lookup);

        assert_eq!(config.replication.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.replication.max_connections, 12);
        assert_eq!(config.limits.long_poll_timeout_ms, 750);
        assert_eq!(config.limits.max_batch_tasks, 40);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let lookup = vars(&[
            ("SHARDREPL_MAX_CONNECTIONS", "lots"),
            ("SHARDREPL_LONG_POLL_TIMEOUT_MS", "   "),
        ]);

        let mut config = Config::default();
        apply_overrides_from(&mut config, lookup);
        let defaults = Config::default();
        assert_eq!(
            config.replication.max_connections,
            defaults.replication.max_connections
        );
        assert_eq!(
            config.limits.long_poll_timeout_ms,
            defaults.limits.long_poll_timeout_ms
        );
    }
}

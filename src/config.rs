//! Engine configuration
//!
//! Defaults suit an embedded engine; every field can be overridden in code or
//! through `CONCORD_*` environment variables

use std::thread;

use crate::error::SchemaError;

pub const ENV_RETAIN_EVENT_LOG: &str = "CONCORD_RETAIN_EVENT_LOG";
pub const ENV_EVENT_LOG_CAPACITY: &str = "CONCORD_EVENT_LOG_CAPACITY";
pub const ENV_FAILURE_HISTORY: &str = "CONCORD_FAILURE_HISTORY";
pub const ENV_CATCH_PANICS: &str = "CONCORD_CATCH_PANICS";
pub const ENV_PARALLELISM: &str = "CONCORD_PARALLELISM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Keep every admitted event so stale views can be rebuilt by replay
    pub retain_event_log: bool,

    /// How many events the log keeps before evicting the oldest
    pub event_log_capacity: usize,

    /// How many maintenance failures are kept for inspection
    pub failure_history: usize,

    /// Contain panics raised by definitions to their own maintenance batch
    pub catch_panics: bool,

    /// Upper bound on worker threads used by `Engine::apply_batch`
    pub parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retain_event_log: true,
            event_log_capacity: 100_000,
            failure_history: 256,
            catch_panics: true,
            parallelism: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

impl EngineConfig {
    pub fn with_event_log(mut self, retain: bool) -> Self {
        self.retain_event_log = retain;
        self
    }

    pub fn with_event_log_capacity(mut self, events: usize) -> Self {
        self.event_log_capacity = events;
        self
    }

    pub fn with_failure_history(mut self, failures: usize) -> Self {
        self.failure_history = failures;
        self
    }

    pub fn with_catch_panics(mut self, catch: bool) -> Self {
        self.catch_panics = catch;
        self
    }

    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers;
        self
    }

    /// Defaults overridden by any `CONCORD_*` variables present in the environment
    pub fn from_env() -> Result<Self, SchemaError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SchemaError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_RETAIN_EVENT_LOG) {
            config.retain_event_log = parse_bool(ENV_RETAIN_EVENT_LOG, &value)?;
        }
        if let Some(value) = lookup(ENV_EVENT_LOG_CAPACITY) {
            config.event_log_capacity = parse_usize(ENV_EVENT_LOG_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_FAILURE_HISTORY) {
            config.failure_history = parse_usize(ENV_FAILURE_HISTORY, &value)?;
        }
        if let Some(value) = lookup(ENV_CATCH_PANICS) {
            config.catch_panics = parse_bool(ENV_CATCH_PANICS, &value)?;
        }
        if let Some(value) = lookup(ENV_PARALLELISM) {
            let workers = parse_usize(ENV_PARALLELISM, &value)?;
            if workers == 0 {
                return Err(SchemaError::InvalidConfig { key: ENV_PARALLELISM, value });
            }
            config.parallelism = workers;
        }

        Ok(config)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, SchemaError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SchemaError::InvalidConfig { key, value: value.to_string() }),
    }
}

fn parse_usize(key: &'static str, value: &str) -> Result<usize, SchemaError> {
    value
        .trim()
        .parse()
        .map_err(|_| SchemaError::InvalidConfig { key, value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_RETAIN_EVENT_LOG, "no"),
            (ENV_FAILURE_HISTORY, "8"),
            (ENV_EVENT_LOG_CAPACITY, "500"),
            (ENV_PARALLELISM, " 3 "),
        ]))
        .unwrap();

        assert!(!config.retain_event_log);
        assert_eq!(config.failure_history, 8);
        assert_eq!(config.event_log_capacity, 500);
        assert_eq!(config.parallelism, 3);
        assert!(config.catch_panics);
    }

    #[test]
    fn rejects_garbage() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_CATCH_PANICS, "maybe")])).unwrap_err();
        assert_eq!(
            err,
            SchemaError::InvalidConfig { key: ENV_CATCH_PANICS, value: "maybe".to_string() }
        );

        assert!(EngineConfig::from_lookup(lookup(&[(ENV_PARALLELISM, "0")])).is_err());
    }
}

use corvus_core::prelude::*;

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent sandboxes in the CPU pool.
    ///
    /// Defaults to `5`.
    pub cpu_slots: usize,
    /// Concurrent sandboxes in the GPU pool. `0` disables GPU execution.
    ///
    /// Defaults to `1`.
    pub gpu_slots: usize,
    /// Chunks kept per job for late subscribers.
    ///
    /// Defaults to `1000`.
    pub log_buffer_capacity: usize,
    /// How long finished jobs and their logs stay queryable.
    ///
    /// Defaults to one hour.
    pub retention: Duration,
    /// Time between the graceful stop signal and the forceful kill.
    ///
    /// Defaults to 5 seconds.
    pub grace_period: Duration,
    /// Teardown attempts after the first one fails.
    pub teardown_retries: u32,
    /// Delay before the first teardown retry, doubled on each further attempt.
    pub teardown_backoff: Duration,
    /// Maximum non-terminal jobs per owner. [`None`] means unlimited.
    pub owner_quota: Option<usize>,
    pub cpu_image: String,
    pub gpu_image: String,
    /// GPU driver requested for gpu sandboxes.
    pub gpu_driver: String,
    /// Give sandboxes external network access.
    ///
    /// Defaults to `false`.
    pub network_enabled: bool,
    pub profiles: ProfileRegistry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_slots: 5,
            gpu_slots: 1,
            log_buffer_capacity: 1000,
            retention: Duration::from_secs(3600),
            grace_period: Duration::from_secs(5),
            teardown_retries: 3,
            teardown_backoff: Duration::from_millis(200),
            owner_quota: None,
            cpu_image: "python:3.11-slim".to_string(),
            gpu_image: "tensorflow/tensorflow:2.15.0-gpu".to_string(),
            gpu_driver: "nvidia".to_string(),
            network_enabled: false,
            profiles: ProfileRegistry::default(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from the defaults, overridden by `CORVUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "CORVUS_CPU_SLOTS")? {
            config.cpu_slots = v;
        }
        if let Some(v) = parse(&lookup, "CORVUS_GPU_SLOTS")? {
            config.gpu_slots = v;
        }
        if let Some(v) = parse(&lookup, "CORVUS_LOG_BUFFER")? {
            config.log_buffer_capacity = v;
        }
        if let Some(v) = parse(&lookup, "CORVUS_RETENTION_SECS")? {
            config.retention = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "CORVUS_GRACE_SECS")? {
            config.grace_period = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "CORVUS_TEARDOWN_RETRIES")? {
            config.teardown_retries = v;
        }
        if let Some(v) = parse(&lookup, "CORVUS_TEARDOWN_BACKOFF_MS")? {
            config.teardown_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse(&lookup, "CORVUS_OWNER_QUOTA")? {
            config.owner_quota = Some(v);
        }
        if let Some(v) = lookup("CORVUS_CPU_IMAGE") {
            config.cpu_image = v;
        }
        if let Some(v) = lookup("CORVUS_GPU_IMAGE") {
            config.gpu_image = v;
        }
        if let Some(v) = lookup("CORVUS_GPU_DRIVER") {
            config.gpu_driver = v;
        }
        if let Some(v) = parse(&lookup, "CORVUS_NETWORK")? {
            config.network_enabled = v;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CORVUS_CPU_SLOTS", "2"),
            ("CORVUS_OWNER_QUOTA", "3"),
            ("CORVUS_GRACE_SECS", "1"),
            ("CORVUS_NETWORK", "true"),
        ]))
        .unwrap();

        assert_eq!(config.cpu_slots, 2);
        assert_eq!(config.gpu_slots, 1);
        assert_eq!(config.owner_quota, Some(3));
        assert_eq!(config.grace_period, Duration::from_secs(1));
        assert!(config.network_enabled);
    }

    #[test]
    fn bad_value_is_reported() {
        let err = EngineConfig::from_lookup(lookup(&[("CORVUS_GPU_SLOTS", "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "CORVUS_GPU_SLOTS".to_string(),
                value: "many".to_string()
            }
        );
    }
}

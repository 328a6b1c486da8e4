//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Heartbeat timeout ({timeout}s) must exceed the heartbeat interval ({interval}s)")]
    HeartbeatWindowTooSmall { timeout: u64, interval: u64 },

    #[error("Gateway max_retries cannot be 0")]
    ZeroMaxRetries,

    #[error("Engine retry_base_delay_ms cannot be 0")]
    ZeroRetryBaseDelay,
}

/// Loads `Config` with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.vectormesh/config.yaml`
    /// 3. `.vectormesh/local.yaml`
    /// 4. Environment variables (`VECTORMESH_` prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".vectormesh/config.yaml"))
            .merge(Yaml::file(".vectormesh/local.yaml"))
            .merge(Env::prefixed("VECTORMESH_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.gateway.heartbeat_timeout_secs <= config.gateway.heartbeat_interval_secs {
            return Err(ConfigError::HeartbeatWindowTooSmall {
                timeout: config.gateway.heartbeat_timeout_secs,
                interval: config.gateway.heartbeat_interval_secs,
            });
        }

        if config.gateway.max_retries == 0 {
            return Err(ConfigError::ZeroMaxRetries);
        }

        if config.engine.retry_base_delay_ms == 0 {
            return Err(ConfigError::ZeroRetryBaseDelay);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ConfigLoader::validate(&Config::default()).unwrap();
    }

    #[test]
    fn rejects_bad_log_level_and_format() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }

    #[test]
    fn rejects_heartbeat_timeout_below_interval() {
        let mut config = Config::default();
        config.gateway.heartbeat_timeout_secs = 10;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::HeartbeatWindowTooSmall { .. })
        ));
    }
}

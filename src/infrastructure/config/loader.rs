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

    #[error("Invalid role: {0}. Must be one of: emperor, worker, seneschal")]
    InvalidRole(String),

    #[error("Invalid seed address: {0}. Expected host:port")]
    InvalidSeed(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(usize),

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error(
        "Invalid election timers: stale threshold ({stale}s) must exceed the heartbeat interval ({heartbeat}s) and the quorum wait ({wait}s) cannot be 0"
    )]
    InvalidElectionTimers { heartbeat: u64, stale: u64, wait: u64 },

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.voidlux/config.yaml` (project config)
    /// 3. `.voidlux/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`VOIDLUX_*` prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".voidlux/config.yaml"))
            .merge(Yaml::file(".voidlux/local.yaml"))
            .merge(Env::prefixed("VOIDLUX_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
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
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        if crate::domain::models::NodeRole::parse_str(&config.node.role).is_none() {
            return Err(ConfigError::InvalidRole(config.node.role.clone()));
        }
        for seed in &config.mesh.seeds {
            if !seed.contains(':') {
                return Err(ConfigError::InvalidSeed(seed.clone()));
            }
        }
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.mesh.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.mesh.max_connections));
        }
        if config.retry.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.retry.max_retries));
        }
        if config.mesh.emperor_stale_secs <= config.mesh.emperor_heartbeat_secs
            || config.mesh.election_wait_secs == 0
        {
            return Err(ConfigError::InvalidElectionTimers {
                heartbeat: config.mesh.emperor_heartbeat_secs,
                stale: config.mesh.emperor_stale_secs,
                wait: config.mesh.election_wait_secs,
            });
        }
        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ConfigLoader::validate(&Config::default()).is_ok());
    }

    #[test]
    fn bad_role_is_rejected() {
        let mut config = Config::default();
        config.node.role = "king".to_string();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidRole(_))));
    }

    #[test]
    fn seed_without_port_is_rejected() {
        let mut config = Config::default();
        config.mesh.seeds = vec!["justahost".to_string()];
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidSeed(_))));
    }

    #[test]
    fn stale_threshold_must_exceed_heartbeat() {
        let mut config = Config::default();
        config.mesh.emperor_stale_secs = config.mesh.emperor_heartbeat_secs;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidElectionTimers { .. })
        ));
    }

    #[test]
    fn backoff_must_grow() {
        let mut config = Config::default();
        config.retry.initial_backoff_ms = 5_000;
        config.retry.max_backoff_ms = 1_000;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidBackoff(_, _))));
    }
}

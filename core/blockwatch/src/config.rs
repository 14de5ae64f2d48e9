//! Configuration of the streaming engine.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings of a [`StreamingEngine`](crate::engine::StreamingEngine).
///
/// # Example
/// ```
/// use blockwatch::config::EngineConfig;
///
/// let config = EngineConfig::from_toml_str(r#"
///     max_connections = 4
///     retry_backoff = "5s"
/// "#).unwrap();
/// assert_eq!(config.max_connections, 4);
/// assert!(config.blocking);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of requests in flight at the same time.
    pub max_connections: usize,
    /// Whether new sources use blocking queries (long-polling) or fetch once.
    pub blocking: bool,
    /// How long the backend may hold a blocking request, if the backend default is not suitable.
    #[serde(with = "humantime_serde")]
    pub wait: Option<Duration>,
    /// How long to wait before retrying when the backend is unavailable.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Minimum delay between two blocking requests that returned the same cursor.
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    /// Maximum number of saved (detached) source states.
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            blocking: true,
            wait: None,
            retry_backoff: Duration::from_secs(3),
            min_interval: Duration::ZERO,
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_connections must be at least 1")]
    NoConnection,
    #[error("cache_capacity must be at least 1")]
    NoCache,
}

impl EngineConfig {
    /// Parses the configuration from a TOML string, then validates it.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(s).context("invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("failed to load config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::NoConnection);
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::NoCache);
        }
        Ok(())
    }
}

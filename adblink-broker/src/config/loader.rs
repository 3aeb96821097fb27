//! Configuration loader

use std::path::Path;

use adblink_utils::{config_file, AdblinkError, Result};

use super::BrokerConfig;
use crate::agent::validate_agent_options;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<BrokerConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(BrokerConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<BrokerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| AdblinkError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<BrokerConfig> {
        toml::from_str(content).map_err(|e| AdblinkError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &BrokerConfig) -> Result<()> {
        if config.agent_name.trim().is_empty() {
            return Err(AdblinkError::config("agent_name must not be empty"));
        }

        if config.retry.initial_delay_ms == 0 {
            return Err(AdblinkError::config("initial_delay_ms must be at least 1"));
        }

        if config.retry.max_delay_ms < config.retry.initial_delay_ms {
            return Err(AdblinkError::config(
                "max_delay_ms must not be smaller than initial_delay_ms",
            ));
        }

        if config.worker.thread_name.is_empty() {
            return Err(AdblinkError::config("thread_name must not be empty"));
        }

        validate_agent_options(&config.jdwp_options)
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<BrokerConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }
}

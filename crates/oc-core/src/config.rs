//! Configuration system for the oxidized-cell atomic primitives

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound for `AtomicConfig::htm_retries`
pub const MAX_HTM_RETRIES: u32 = 64;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub atomic: AtomicConfig,
    pub debug: DebugConfig,
    pub stress: StressConfig,
}

/// Commit strategy and spin policy settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AtomicConfig {
    /// Hardware transactional memory usage
    pub htm: HtmMode,
    /// Re-attempts of a transiently aborted hardware transaction
    pub htm_retries: u32,
    /// Full scans of an exhausted slot pool before yielding the thread
    pub pool_spin_limit: u32,
}

/// Hardware transactional memory mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum HtmMode {
    /// Use it when the CPU reports support
    #[default]
    Auto,
    /// Never use it
    Disabled,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Workload for the stress harness
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StressConfig {
    pub threads: u32,
    pub cells: u32,
    pub transfers_per_thread: u32,
    pub cells_per_transfer: u32,
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self {
            htm: HtmMode::default(),
            htm_retries: 8,
            pool_spin_limit: 16,
        }
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            cells: 64,
            transfers_per_thread: 10_000,
            cells_per_transfer: 3,
        }
    }
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl Config {
    /// Load configuration from the default path, or create it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load and validate configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings outside their supported range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.atomic.htm_retries > MAX_HTM_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "htm_retries must be at most {}",
                MAX_HTM_RETRIES
            )));
        }

        let stress = &self.stress;
        if stress.threads == 0 || stress.cells == 0 {
            return Err(ConfigError::Invalid(
                "stress workload needs at least one thread and one cell".to_string(),
            ));
        }
        if stress.cells_per_transfer < 2 || stress.cells_per_transfer > stress.cells {
            return Err(ConfigError::Invalid(format!(
                "cells_per_transfer must be between 2 and {}",
                stress.cells
            )));
        }

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-cell")
            .join("atomic.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.atomic.htm, HtmMode::Auto);
        assert_eq!(config.atomic.htm_retries, 8);
        assert_eq!(config.atomic.pool_spin_limit, 16);
        assert_eq!(config.debug.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.atomic.htm = HtmMode::Disabled;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[atomic]\nhtm = \"Disabled\"\n").unwrap();
        assert_eq!(parsed.atomic.htm, HtmMode::Disabled);
        assert_eq!(parsed.atomic.htm_retries, 8);
        assert_eq!(parsed.stress, StressConfig::default());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = Config::default();
        config.atomic.htm_retries = MAX_HTM_RETRIES + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.stress.cells_per_transfer = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("oc-core-config-{}", std::process::id()))
            .join("atomic.toml");

        let mut config = Config::default();
        config.atomic.pool_spin_limit = 3;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.atomic.pool_spin_limit, 3);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}

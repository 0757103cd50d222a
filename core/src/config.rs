// Session configuration
//
// Stored as TOML when the embedding application wants a file, e.g.
//
//     target_name = "Test"
//     log_filter = "blelink_core=debug"
//
// The scan period and the target feature are protocol constants, not settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid target name: must not be empty")]
    EmptyTargetName,

    #[error("Invalid log filter: must not be empty")]
    EmptyLogFilter,
}

/// Configuration of one BLE session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Advertised name of the peripheral to connect to automatically.
    /// `None` scans without ever auto-connecting.
    pub target_name: Option<String>,

    /// Fallback tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_name: None,
            log_filter: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Returns an updated copy targeting `name`
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.target_name.as_deref(), Some(name) if name.is_empty()) {
            return Err(ConfigError::EmptyTargetName);
        }
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::EmptyLogFilter);
        }
        Ok(())
    }

    /// Parse and validate TOML text; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse session config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Write as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize session config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

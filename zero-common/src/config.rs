//! Configuration management for Zero services.
//!
//! All Zero services share a configuration directory at `~/.codecoder/`.
//! The core file is `config.json`; service sections may also live in their
//! own modular files (see [`crate::config_loader`]).
//!
//! # Configuration Priority
//!
//! 1. Environment variables (ZERO_* prefix)
//! 2. Modular files (`screener.json`) merged over `config.json`
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ZERO_LOG_LEVEL` → observability.log_level
//! - `ZERO_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config_loader::load_modular_config;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".codecoder"),
        |dirs| dirs.home_dir().join(".codecoder"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration shared by Zero services.
///
/// Service sections are kept as raw JSON and decoded on demand with
/// [`Config::screener_section`], so each service owns its own typed config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Screener section (merged from `screener.json` when present)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub screener: serde_json::Value,
}

impl Config {
    /// Load configuration from the default directory.
    ///
    /// Missing files are not an error; defaults are used instead.
    pub fn load() -> Result<Self> {
        Self::load_dir(&config_dir())
    }

    /// Load configuration from a directory containing `config.json` and
    /// optional modular files.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.join("config.json").exists() && !dir.join("screener.json").exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let merged = load_modular_config(Some(dir.to_path_buf()))?;
        serde_json::from_value(merged)
            .with_context(|| format!("Failed to parse config from {}", dir.display()))
    }

    /// Load configuration from a specific file path, without modular merging.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ZERO_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("ZERO_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Decode the screener section into a typed config.
    ///
    /// An absent section yields `T::default()`.
    pub fn screener_section<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        if self.screener.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.screener.clone()).context("Failed to parse screener section")
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Aliases: "level" for backward compatibility with existing config files
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    /// Aliases: "format" for backward compatibility with existing config files
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to exclude from logging.
    ///
    /// These modules will be set to `warn` level to reduce noise.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

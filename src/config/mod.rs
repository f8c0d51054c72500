//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into validated, type-safe structures.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path specified via the CLI (must exist)
//! 2. Default location:
//!    - **Linux/macOS:** `~/.capserve/config.json`
//!    - **Windows:** `%USERPROFILE%\.capserve\config.json`
//!
//! A missing file at the default location is not an error: the server runs
//! with built-in defaults.

mod settings;

pub use settings::{
    Config, LoggingConfig, MetricsConfig, ServerConfig, ShutdownConfig, TransportMode,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.capserve/`
/// - **Windows:** `%USERPROFILE%\.capserve\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".capserve"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// An explicit `path` must exist. With no explicit path, the default
/// location is used if present, and built-in defaults otherwise.
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(explicit) => read_config(explicit),
        None => match default_config_path() {
            Some(default) if default.exists() => read_config(&default),
            _ => Ok(Config::default()),
        },
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    // Validate the configuration
    config.validate()?;

    Ok(config)
}

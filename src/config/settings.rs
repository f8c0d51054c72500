//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::SocketAddr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Shutdown settings.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_request_bytes == 0 {
            return Err(ConfigError::ValidationError {
                message: "server.max_request_bytes must be greater than zero".to_string(),
            });
        }

        if self.shutdown.grace_seconds == 0 {
            return Err(ConfigError::ValidationError {
                message: "shutdown.grace_seconds must be greater than zero".to_string(),
            });
        }

        if self.server.transport == TransportMode::Concurrent {
            self.server.bind_addr()?;
        }

        Ok(())
    }
}

/// Which transport the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Single-connection, strictly sequential stdin/stdout session.
    Line,
    /// Concurrent HTTP endpoint.
    Concurrent,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server label used in logs and metric samples.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Transport to serve. Default: "line"
    #[serde(default = "default_transport")]
    pub transport: TransportMode,

    /// Bind address for the concurrent transport.
    #[serde(default = "default_bind")]
    pub bind: Option<String>,

    /// Maximum accepted request frame size in bytes.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl ServerConfig {
    /// Parses the configured bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is missing or unparseable.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let bind = self.bind.as_deref().ok_or_else(|| ConfigError::ValidationError {
            message: "server.bind is required for the concurrent transport".to_string(),
        })?;
        bind.parse().map_err(|_| ConfigError::ValidationError {
            message: format!("server.bind is not a valid socket address: {bind}"),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            transport: default_transport(),
            bind: default_bind(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

fn default_server_name() -> String {
    "capserve".to_string()
}

const fn default_transport() -> TransportMode {
    TransportMode::Line
}

fn default_bind() -> Option<String> {
    Some("127.0.0.1:8700".to_string())
}

const fn default_max_request_bytes() -> usize {
    1024 * 1024
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Grace deadline for in-flight dispatches, in seconds.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
        }
    }
}

const fn default_grace_seconds() -> u64 {
    5
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Also record samples for dispatches rejected before reaching a
    /// handler. Default: false (only handler invocations are sampled).
    #[serde(default)]
    pub record_validation_failures: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

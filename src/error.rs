//! Error types for capserve.
//!
//! The taxonomy follows the propagation policy of the runtime: only a
//! protocol violation may end a session, only a duplicate registration may
//! prevent startup, and every other condition is recovered locally and
//! reported back to the caller as a well-formed response envelope.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed dispatch, carried on the wire as `error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed envelope. The session or connection may be torn down.
    #[serde(rename = "ProtocolError")]
    Protocol,
    /// The requested capability name is not registered.
    UnknownCapability,
    /// The arguments failed schema validation; the handler was never invoked.
    InvalidInput,
    /// The handler explicitly reported a business failure.
    #[serde(rename = "DomainError")]
    Domain,
    /// The handler raised an unrecoverable fault that the recovery layer
    /// converted into a reported error.
    HandlerFault,
}

impl ErrorKind {
    /// Returns the stable wire label for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "ProtocolError",
            Self::UnknownCapability => "UnknownCapability",
            Self::InvalidInput => "InvalidInput",
            Self::Domain => "DomainError",
            Self::HandlerFault => "HandlerFault",
        }
    }
}

/// A business failure reported by a handler.
///
/// Domain errors are surfaced to the caller verbatim; they are not server
/// faults and never terminate the session.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DomainError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl DomainError {
    /// Creates a new domain error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A classified dispatch failure, ready to encode as a failure envelope.
#[derive(Debug, Clone, Error)]
#[error("{}: {}", .kind.as_str(), .message)]
pub struct DispatchFailure {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl DispatchFailure {
    /// Creates a new dispatch failure.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<DomainError> for DispatchFailure {
    fn from(error: DomainError) -> Self {
        Self::new(ErrorKind::Domain, error.message)
    }
}

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors raised while running a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Transport I/O failed.
    #[error("transport I/O failed")]
    Io {
        /// The underlying IO error.
        #[from]
        source: std::io::Error,
    },

    /// The server loop failed.
    #[error("server failed: {message}")]
    Serve {
        /// Description of the failure.
        message: String,
    },
}

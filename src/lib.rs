//! capserve: a capability invocation server runtime.
//!
//! The runtime accepts structured "call this named capability with these
//! arguments" requests, validates them against declared schemas, dispatches
//! them to a registered handler through a composable chain of cross-cutting
//! behaviours, and returns a structured result or a structured error.
//!
//! # Architecture
//!
//! ```text
//! transport ──▶ envelope decode ──▶ Dispatcher ──▶ middleware chain ──▶ handler
//!    ▲                                 │       (recovery/logging/metrics)
//!    └───────── response envelope ◀────┘
//! ```
//!
//! The capability registry and the middleware chain are built once at
//! startup and shared read-only across every dispatch. Two transports
//! produce identical dispatch semantics: a strictly sequential line session
//! over stdin/stdout, and a concurrent HTTP endpoint sharing one dispatcher
//! across many connections. A shutdown coordinator drains in-flight work
//! bounded by a grace deadline.
//!
//! # Modules
//!
//! - [`builtin`] — built-in demonstration capabilities
//! - [`config`] — configuration loading and validation
//! - [`dispatch`] — per-request resolve/validate/invoke pipeline
//! - [`error`] — error taxonomy
//! - [`metrics`] — counters and latency histograms with pull-based export
//! - [`middleware`] — the recovery/logging/metrics chain
//! - [`protocol`] — request/response envelopes
//! - [`registry`] — capabilities and the handler contract
//! - [`schema`] — declarative argument schemas
//! - [`shutdown`] — coordinated graceful shutdown
//! - [`transport`] — line session and concurrent endpoint

pub mod builtin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod shutdown;
pub mod transport;

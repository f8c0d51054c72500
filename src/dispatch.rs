//! Request dispatch: resolve, validate, invoke through the middleware chain.
//!
//! Each request moves through four stages: received (decoded by the
//! transport), validating (capability resolution and schema conformance),
//! dispatching (one traversal of the middleware chain, one handler
//! invocation), and completed (a response envelope, success or failure).
//! Requests rejected during validation never reach the chain or the
//! handler, and nothing at this layer retries.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DispatchFailure, ErrorKind};
use crate::metrics::{MetricsRegistry, SampleKey, METHOD_CALL};
use crate::middleware::{Invocation, MiddlewareChain};
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::registry::{CapabilityRegistry, RequestContext};

/// Dispatch-time options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Record metric samples for dispatches rejected before reaching a
    /// handler (`UnknownCapability` and `InvalidInput`). Off by default:
    /// only handler-reaching dispatches are sampled by the metrics frame.
    pub record_validation_failures: bool,
}

/// Resolves, validates, and dispatches request envelopes.
///
/// Constructed once at startup and shared across transports; holds only
/// frozen state plus the metrics registry.
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    chain: MiddlewareChain,
    metrics: Arc<MetricsRegistry>,
    server_label: String,
    options: DispatchOptions,
}

impl Dispatcher {
    /// Creates a dispatcher over a frozen registry and composed chain.
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        chain: MiddlewareChain,
        metrics: Arc<MetricsRegistry>,
        server_label: impl Into<String>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            registry,
            chain,
            metrics,
            server_label: server_label.into(),
            options,
        }
    }

    /// Dispatches one decoded envelope to its capability.
    ///
    /// Always returns a well-formed response envelope carrying the
    /// request's correlation token; no outcome at this layer terminates the
    /// transport.
    pub async fn dispatch(
        &self,
        envelope: RequestEnvelope,
        context: RequestContext,
    ) -> ResponseEnvelope {
        let RequestEnvelope {
            capability: name,
            arguments,
            id,
        } = envelope;

        let Some(capability) = self.registry.resolve(&name) else {
            tracing::debug!(capability = %name, request_id = %id, "unknown capability");
            self.record_rejection(&name);
            return ResponseEnvelope::failure(
                id,
                &DispatchFailure::new(
                    ErrorKind::UnknownCapability,
                    format!("no capability registered under '{name}'"),
                ),
            );
        };

        let arguments = match capability.input_schema().conform(arguments) {
            Ok(conformed) => conformed,
            Err(violation) => {
                tracing::debug!(
                    capability = %name,
                    request_id = %id,
                    path = %violation.path,
                    "input validation failed"
                );
                self.record_rejection(&name);
                return ResponseEnvelope::failure(
                    id,
                    &DispatchFailure::new(ErrorKind::InvalidInput, violation.to_string()),
                );
            }
        };

        let outcome = self
            .chain
            .execute(
                context,
                Invocation {
                    capability,
                    arguments,
                },
            )
            .await;

        match outcome {
            Ok(output) => ResponseEnvelope::success(id, output),
            Err(failure) => ResponseEnvelope::failure(id, &failure),
        }
    }

    fn record_rejection(&self, capability: &str) {
        if self.options.record_validation_failures {
            self.metrics.record(
                SampleKey {
                    server: self.server_label.clone(),
                    method: METHOD_CALL.to_string(),
                    capability: capability.to_string(),
                    success: false,
                },
                Duration::ZERO,
            );
        }
    }
}

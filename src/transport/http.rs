//! Concurrent HTTP endpoint.
//!
//! Accepts many simultaneous connections and submits each decoded request
//! to the shared dispatcher independently; responses complete in any order
//! across requests, each correlated by its own token.
//!
//! Besides `POST /rpc`, the same listener serves three read-only routes
//! that bypass the dispatcher entirely:
//!
//! - `GET /healthz` — liveness probe, answerable even under load
//! - `GET /metrics` — pull-based snapshot of counters and histograms
//! - `GET /capabilities` — registered capability definitions

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::dispatch::Dispatcher;
use crate::error::TransportError;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::protocol::{parse_envelope, ResponseEnvelope};
use crate::registry::{CapabilityRegistry, RequestContext};
use crate::shutdown::{DrainOutcome, ShutdownCoordinator, ShutdownHandle};

/// Shared state for the endpoint's request handlers.
#[derive(Clone)]
struct EndpointState {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<CapabilityRegistry>,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownHandle,
    max_request_bytes: usize,
}

/// The concurrent transport: one listener, many in-flight dispatches.
pub struct ConcurrentEndpoint {
    bind: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<CapabilityRegistry>,
    metrics: Arc<MetricsRegistry>,
    coordinator: ShutdownCoordinator,
    grace: Duration,
    max_request_bytes: usize,
}

impl ConcurrentEndpoint {
    /// Creates an endpoint bound to `bind` once served.
    #[must_use]
    pub fn new(
        bind: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<CapabilityRegistry>,
        metrics: Arc<MetricsRegistry>,
        coordinator: ShutdownCoordinator,
        grace: Duration,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            bind,
            dispatcher,
            registry,
            metrics,
            coordinator,
            grace,
            max_request_bytes,
        }
    }

    /// Builds the endpoint's router. Exposed so tests can drive it without
    /// binding a socket.
    #[must_use]
    pub fn router(&self) -> Router {
        let state = EndpointState {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.coordinator.handle(),
            max_request_bytes: self.max_request_bytes,
        };

        Router::new()
            .route("/rpc", post(handle_rpc))
            .route("/healthz", get(handle_healthz))
            .route("/metrics", get(handle_metrics))
            .route("/capabilities", get(handle_capabilities))
            .with_state(state)
    }

    /// Serves until the shutdown signal, then drains in-flight dispatches
    /// bounded by the grace deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server
    /// fails.
    pub async fn serve(self) -> Result<(), TransportError> {
        let app = self.router();
        let listener =
            tokio::net::TcpListener::bind(self.bind)
                .await
                .map_err(|e| TransportError::Bind {
                    addr: self.bind.to_string(),
                    source: e,
                })?;
        tracing::info!(addr = %self.bind, "concurrent endpoint listening");

        let shutdown = self.coordinator.handle();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.triggered().await;
        });
        let server = server.into_future();
        tokio::pin!(server);

        let trigger = self.coordinator.handle();
        tokio::select! {
            result = &mut server => {
                result.map_err(|e| TransportError::Serve {
                    message: e.to_string(),
                })?;
            }
            () = trigger.triggered() => {
                tracing::info!("shutdown signal received, draining in-flight dispatches");
                let started = Instant::now();
                match self.coordinator.drain(self.grace).await {
                    DrainOutcome::Completed => {
                        tracing::info!("in-flight dispatches completed");
                        // Let connections finish writing within what is
                        // left of the grace deadline.
                        let remaining = self.grace.saturating_sub(started.elapsed());
                        if tokio::time::timeout(remaining, &mut server).await.is_err() {
                            tracing::warn!("connections still open at deadline, closing");
                        }
                    }
                    DrainOutcome::Abandoned(tokens) => {
                        tracing::warn!(
                            abandoned = ?tokens,
                            "grace deadline elapsed, force-closing remaining dispatches"
                        );
                    }
                }
            }
        }

        tracing::info!("concurrent endpoint stopped");
        Ok(())
    }
}

/// Dispatches one request envelope.
async fn handle_rpc(
    State(state): State<EndpointState>,
    body: Bytes,
) -> (StatusCode, Json<ResponseEnvelope>) {
    if body.len() > state.max_request_bytes {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ResponseEnvelope::protocol_error(
                None,
                "request exceeds the configured size limit",
            )),
        );
    }

    let Ok(raw) = std::str::from_utf8(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ResponseEnvelope::protocol_error(
                None,
                "request body is not valid UTF-8",
            )),
        );
    };

    let envelope = match parse_envelope(raw) {
        Ok(envelope) => envelope,
        Err(violation) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ResponseEnvelope::protocol_error(
                    violation.id,
                    violation.message,
                )),
            );
        }
    };

    // No new work once shutdown has been requested.
    if state.shutdown.is_triggered() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ResponseEnvelope::protocol_error(
                Some(envelope.id),
                "server is shutting down",
            )),
        );
    }

    let context = RequestContext::new(envelope.id.clone(), state.shutdown.cancellation());
    let _guard = state.shutdown.begin(&envelope.id);
    let response = state.dispatcher.dispatch(envelope, context).await;

    (StatusCode::OK, Json(response))
}

/// Liveness probe, independent of dispatcher state.
async fn handle_healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Pull-based metrics snapshot.
async fn handle_metrics(State(state): State<EndpointState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Registered capability definitions, in registration order.
async fn handle_capabilities(State(state): State<EndpointState>) -> Json<serde_json::Value> {
    Json(json!({"capabilities": state.registry.definitions()}))
}

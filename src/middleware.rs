//! Cross-cutting dispatch middleware.
//!
//! Every dispatch traverses a fixed, ordered chain of frames exactly once,
//! regardless of transport: recovery (outermost), then logging, then
//! metrics, then the handler itself. Each frame receives the rest of the
//! chain as a [`Next`] continuation and may run it at most once; a frame
//! that does not run the continuation short-circuits the dispatch.
//!
//! Frames hold no per-request state. The metrics frame owns a shared
//! [`MetricsRegistry`], which is the only state mutated concurrently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::error::{DispatchFailure, ErrorKind};
use crate::metrics::{MetricsRegistry, SampleKey, METHOD_CALL};
use crate::registry::{Capability, RequestContext};

/// Result of one dispatch through the chain.
pub type DispatchOutcome = Result<Value, DispatchFailure>;

/// A boxed dispatch future, owned so frames can supervise it.
pub type DispatchFuture = Pin<Box<dyn Future<Output = DispatchOutcome> + Send>>;

/// One unit of work travelling down the chain: a resolved capability and
/// its schema-conformed arguments.
#[derive(Debug)]
pub struct Invocation {
    /// The resolved capability.
    pub capability: Arc<Capability>,
    /// Conformed arguments, ready for the handler.
    pub arguments: Value,
}

impl Invocation {
    /// The capability's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.capability.name()
    }
}

/// One layer of the chain.
pub trait Middleware: Send + Sync {
    /// Processes the invocation, running `next` at most once.
    fn call(
        &self,
        context: RequestContext,
        invocation: Invocation,
        next: Next,
    ) -> DispatchFuture;
}

/// Continuation into the remainder of the chain.
///
/// The final continuation invokes the handler itself.
pub struct Next {
    frames: Arc<[Arc<dyn Middleware>]>,
    index: usize,
}

impl Next {
    /// Runs the rest of the chain.
    #[must_use]
    pub fn run(self, context: RequestContext, invocation: Invocation) -> DispatchFuture {
        match self.frames.get(self.index) {
            Some(frame) => {
                let frame = Arc::clone(frame);
                let next = Self {
                    frames: self.frames,
                    index: self.index + 1,
                };
                frame.call(context, invocation, next)
            }
            None => Box::pin(async move {
                let Invocation {
                    capability,
                    arguments,
                } = invocation;
                capability
                    .invoke(&context, arguments)
                    .await
                    .map_err(DispatchFailure::from)
            }),
        }
    }
}

/// The fixed, ordered middleware pipeline.
///
/// Composed once at startup and shared, read-only, across all dispatches.
#[derive(Clone)]
pub struct MiddlewareChain {
    frames: Arc<[Arc<dyn Middleware>]>,
}

impl MiddlewareChain {
    /// Composes a chain from ordered frames, outermost first.
    #[must_use]
    pub fn new(frames: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    /// The standard pipeline: recovery, logging, metrics.
    #[must_use]
    pub fn standard(metrics: Arc<MetricsRegistry>, server_label: impl Into<String>) -> Self {
        Self::new(vec![
            Arc::new(Recovery),
            Arc::new(Logging),
            Arc::new(Metrics::new(metrics, server_label)),
        ])
    }

    /// Runs one invocation through the whole chain.
    #[must_use]
    pub fn execute(&self, context: RequestContext, invocation: Invocation) -> DispatchFuture {
        let next = Next {
            frames: Arc::clone(&self.frames),
            index: 0,
        };
        next.run(context, invocation)
    }
}

/// Aborts the supervised task if the dispatch future is dropped, so a
/// closed connection does not leave detached work running.
struct SupervisedTask(tokio::task::JoinHandle<DispatchOutcome>);

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Outermost frame: converts unrecoverable faults from inner frames and the
/// handler into `HandlerFault` results, keeping the process serving.
pub struct Recovery;

impl Middleware for Recovery {
    fn call(
        &self,
        context: RequestContext,
        invocation: Invocation,
        next: Next,
    ) -> DispatchFuture {
        Box::pin(async move {
            let capability = invocation.name().to_string();
            let mut task = SupervisedTask(tokio::spawn(next.run(context, invocation)));
            match (&mut task.0).await {
                Ok(outcome) => outcome,
                Err(fault) => {
                    if fault.is_panic() {
                        tracing::error!(
                            capability = %capability,
                            "handler raised an unrecoverable fault"
                        );
                    }
                    Err(DispatchFailure::new(
                        ErrorKind::HandlerFault,
                        format!("capability '{capability}' failed with an internal fault"),
                    ))
                }
            }
        })
    }
}

/// Records structured start/completion entries on the diagnostic channel.
///
/// The diagnostic channel (stderr via the tracing subscriber) is never the
/// channel used for protocol responses.
pub struct Logging;

impl Middleware for Logging {
    fn call(
        &self,
        context: RequestContext,
        invocation: Invocation,
        next: Next,
    ) -> DispatchFuture {
        Box::pin(async move {
            let capability = invocation.name().to_string();
            let request_id = context.request_id().clone();
            tracing::info!(
                capability = %capability,
                request_id = %request_id,
                "capability invocation started"
            );

            let started = Instant::now();
            let outcome = next.run(context, invocation).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match &outcome {
                Ok(_) => tracing::info!(
                    capability = %capability,
                    request_id = %request_id,
                    duration_ms,
                    ok = true,
                    "capability invocation completed"
                ),
                Err(failure) => tracing::info!(
                    capability = %capability,
                    request_id = %request_id,
                    duration_ms,
                    ok = false,
                    kind = failure.kind.as_str(),
                    "capability invocation completed"
                ),
            }

            outcome
        })
    }
}

/// Records one metric sample per completed dispatch, including failures.
///
/// Domain failures count as unsuccessful samples: classification uses the
/// dispatch outcome, which already folds in the handler's own error flag.
/// A dispatch that never completes inside this frame (a fault unwinding to
/// the recovery layer, or a dropped connection) still records one failure
/// sample through the guard's drop.
pub struct Metrics {
    registry: Arc<MetricsRegistry>,
    server: String,
}

impl Metrics {
    /// Creates the metrics frame.
    #[must_use]
    pub fn new(registry: Arc<MetricsRegistry>, server: impl Into<String>) -> Self {
        Self {
            registry,
            server: server.into(),
        }
    }
}

/// Records exactly one sample: explicitly on completion, or as a failure
/// when dropped without completing.
struct PendingSample {
    registry: Arc<MetricsRegistry>,
    server: String,
    capability: String,
    started: Instant,
    recorded: bool,
}

impl PendingSample {
    fn new(registry: Arc<MetricsRegistry>, server: String, capability: String) -> Self {
        Self {
            registry,
            server,
            capability,
            started: Instant::now(),
            recorded: false,
        }
    }

    fn record(&self, success: bool) {
        self.registry.record(
            SampleKey {
                server: self.server.clone(),
                method: METHOD_CALL.to_string(),
                capability: self.capability.clone(),
                success,
            },
            self.started.elapsed(),
        );
    }

    fn complete(&mut self, success: bool) {
        self.recorded = true;
        self.record(success);
    }
}

impl Drop for PendingSample {
    fn drop(&mut self) {
        if !self.recorded {
            self.record(false);
        }
    }
}

impl Middleware for Metrics {
    fn call(
        &self,
        context: RequestContext,
        invocation: Invocation,
        next: Next,
    ) -> DispatchFuture {
        let registry = Arc::clone(&self.registry);
        let server = self.server.clone();
        Box::pin(async move {
            let mut pending =
                PendingSample::new(registry, server, invocation.name().to_string());
            let outcome = next.run(context, invocation).await;
            pending.complete(outcome.is_ok());
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::DomainError;
    use crate::protocol::RequestId;
    use crate::registry::handler_fn;
    use crate::schema::Schema;

    fn capability_with(handler: Arc<dyn crate::registry::Handler>) -> Arc<Capability> {
        Arc::new(Capability::new(
            "probe",
            Schema::object(),
            Schema::object(),
            handler,
        ))
    }

    fn invocation(capability: &Arc<Capability>) -> Invocation {
        Invocation {
            capability: Arc::clone(capability),
            arguments: json!({}),
        }
    }

    fn context() -> RequestContext {
        RequestContext::detached(RequestId::Number(1))
    }

    fn boom() -> Result<Value, DomainError> {
        panic!("boom")
    }

    /// Frame that records when it runs, for ordering assertions.
    struct Probe {
        label: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Probe {
        fn call(
            &self,
            context: RequestContext,
            invocation: Invocation,
            next: Next,
        ) -> DispatchFuture {
            let label = self.label;
            let trace = Arc::clone(&self.trace);
            Box::pin(async move {
                trace.lock().unwrap().push(format!("{label}:enter"));
                let outcome = next.run(context, invocation).await;
                trace.lock().unwrap().push(format!("{label}:exit"));
                outcome
            })
        }
    }

    #[tokio::test]
    async fn frames_run_in_composition_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            Arc::new(Probe {
                label: "outer",
                trace: Arc::clone(&trace),
            }),
            Arc::new(Probe {
                label: "inner",
                trace: Arc::clone(&trace),
            }),
        ]);

        let capability = capability_with(handler_fn(|_context, _arguments| async move {
            Ok(json!({"done": true}))
        }));
        let outcome = chain.execute(context(), invocation(&capability)).await;
        assert!(outcome.is_ok());

        let recorded = trace.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec!["outer:enter", "inner:enter", "inner:exit", "outer:exit"]
        );
    }

    #[tokio::test]
    async fn recovery_converts_panic_to_handler_fault() {
        let chain = MiddlewareChain::new(vec![Arc::new(Recovery)]);
        let capability =
            capability_with(handler_fn(|_context, _arguments| async move { boom() }));

        let outcome = chain.execute(context(), invocation(&capability)).await;
        let failure = outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::HandlerFault);
        assert!(failure.message.contains("probe"));
    }

    #[tokio::test]
    async fn recovery_passes_domain_errors_through() {
        let chain = MiddlewareChain::new(vec![Arc::new(Recovery)]);
        let capability = capability_with(handler_fn(|_context, _arguments| async move {
            Err(DomainError::new("business failure"))
        }));

        let outcome = chain.execute(context(), invocation(&capability)).await;
        let failure = outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Domain);
        assert_eq!(failure.message, "business failure");
    }

    #[tokio::test]
    async fn metrics_records_one_sample_per_dispatch() {
        let registry = Arc::new(MetricsRegistry::new());
        let chain = MiddlewareChain::standard(Arc::clone(&registry), "test");
        let capability = capability_with(handler_fn(|_context, _arguments| async move {
            Ok(json!({}))
        }));

        chain
            .execute(context(), invocation(&capability))
            .await
            .unwrap();
        chain
            .execute(context(), invocation(&capability))
            .await
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.samples.len(), 1);
        assert_eq!(snapshot.samples[0].count, 2);
        assert!(snapshot.samples[0].key.success);
    }

    #[tokio::test]
    async fn metrics_classifies_failures() {
        let registry = Arc::new(MetricsRegistry::new());
        let chain = MiddlewareChain::standard(Arc::clone(&registry), "test");

        let failing = capability_with(handler_fn(|_context, _arguments| async move {
            Err(DomainError::new("nope"))
        }));
        let panicking =
            capability_with(handler_fn(|_context, _arguments| async move { boom() }));

        let _ = chain.execute(context(), invocation(&failing)).await;
        let _ = chain.execute(context(), invocation(&panicking)).await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.samples.len(), 1);
        assert!(!snapshot.samples[0].key.success);
        assert_eq!(snapshot.samples[0].count, 2);
    }

    #[tokio::test]
    async fn slow_handler_duration_is_observed() {
        let registry = Arc::new(MetricsRegistry::new());
        let chain = MiddlewareChain::standard(Arc::clone(&registry), "test");
        let capability = capability_with(handler_fn(|_context, _arguments| async move {
            tokio::time::sleep(Duration::from_millis(12)).await;
            Ok(json!({}))
        }));

        chain
            .execute(context(), invocation(&capability))
            .await
            .unwrap();

        let snapshot = registry.snapshot();
        assert!(snapshot.samples[0].total_micros >= 12_000);
    }
}

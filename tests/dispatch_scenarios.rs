//! End-to-end dispatch scenarios against the public runtime API.
//!
//! These tests register capabilities, dispatch request envelopes, and
//! verify the structured responses the caller would see on the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use capserve::builtin;
use capserve::dispatch::{DispatchOptions, Dispatcher};
use capserve::error::{DomainError, ErrorKind};
use capserve::metrics::MetricsRegistry;
use capserve::middleware::MiddlewareChain;
use capserve::protocol::{RequestEnvelope, RequestId, ResponseEnvelope};
use capserve::registry::{handler_fn, Capability, CapabilityRegistry, RequestContext};
use capserve::schema::Schema;

fn build_dispatcher(registry: CapabilityRegistry) -> Arc<Dispatcher> {
    let metrics = Arc::new(MetricsRegistry::new());
    let chain = MiddlewareChain::standard(Arc::clone(&metrics), "test");
    Arc::new(Dispatcher::new(
        Arc::new(registry),
        chain,
        metrics,
        "test",
        DispatchOptions::default(),
    ))
}

fn envelope(capability: &str, arguments: Value, id: i64) -> RequestEnvelope {
    RequestEnvelope {
        capability: capability.to_string(),
        arguments,
        id: RequestId::Number(id),
    }
}

async fn call(dispatcher: &Dispatcher, capability: &str, arguments: Value, id: i64) -> ResponseEnvelope {
    let context = RequestContext::detached(RequestId::Number(id));
    dispatcher
        .dispatch(envelope(capability, arguments, id), context)
        .await
}

fn boom() -> Result<Value, DomainError> {
    panic!("boom")
}

fn boom_capability() -> Capability {
    Capability::new(
        "boom",
        Schema::object(),
        Schema::object(),
        handler_fn(|_context, _arguments| async move { boom() }),
    )
}

#[tokio::test]
async fn echo_round_trip_succeeds() {
    let mut registry = CapabilityRegistry::new();
    builtin::register_builtin(&mut registry).unwrap();
    let dispatcher = build_dispatcher(registry);

    let response = call(&dispatcher, "echo", json!({"text": "hi"}), 1).await;

    assert!(response.ok);
    assert_eq!(response.id, Some(RequestId::Number(1)));
    assert_eq!(response.output, Some(json!({"text": "hi"})));
    assert!(response.error.is_none());
}

#[tokio::test]
async fn unregistered_capability_is_reported() {
    let mut registry = CapabilityRegistry::new();
    builtin::register_builtin(&mut registry).unwrap();
    let dispatcher = build_dispatcher(registry);

    let response = call(&dispatcher, "ghost", json!({}), 2).await;

    assert!(!response.ok);
    assert_eq!(response.id, Some(RequestId::Number(2)));
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::UnknownCapability);
    assert!(error.message.contains("ghost"));
}

#[tokio::test]
async fn missing_required_field_never_invokes_handler() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);

    let mut registry = CapabilityRegistry::new();
    registry
        .register(Capability::new(
            "echo",
            Schema::object()
                .property("text", Schema::string())
                .required(["text"]),
            Schema::object().property("text", Schema::string()),
            handler_fn(move |_context, arguments| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(arguments)
                }
            }),
        ))
        .unwrap();
    let dispatcher = build_dispatcher(registry);

    let response = call(&dispatcher, "echo", json!({}), 3).await;

    assert!(!response.ok);
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::InvalidInput);
    assert!(error.message.contains("$.text"));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_fault_is_contained_and_server_keeps_serving() {
    let mut registry = CapabilityRegistry::new();
    builtin::register_builtin(&mut registry).unwrap();
    registry.register(boom_capability()).unwrap();
    let dispatcher = build_dispatcher(registry);

    let faulted = call(&dispatcher, "boom", json!({}), 4).await;
    assert!(!faulted.ok);
    assert_eq!(faulted.error.unwrap().kind, ErrorKind::HandlerFault);

    // An unrelated call on the same dispatcher still succeeds.
    let healthy = call(&dispatcher, "echo", json!({"text": "still here"}), 5).await;
    assert!(healthy.ok);
    assert_eq!(healthy.output, Some(json!({"text": "still here"})));
}

#[tokio::test]
async fn domain_error_is_reported_verbatim() {
    let mut registry = CapabilityRegistry::new();
    registry
        .register(Capability::new(
            "reject",
            Schema::object(),
            Schema::object(),
            handler_fn(|_context, _arguments| async move {
                Err(DomainError::new("quota exceeded for tenant"))
            }),
        ))
        .unwrap();
    let dispatcher = build_dispatcher(registry);

    let response = call(&dispatcher, "reject", json!({}), 6).await;

    assert!(!response.ok);
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Domain);
    assert_eq!(error.message, "quota exceeded for tenant");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_keep_their_correlation_tokens() {
    let mut registry = CapabilityRegistry::new();
    builtin::register_builtin(&mut registry).unwrap();
    let dispatcher = build_dispatcher(registry);

    let mut tasks = Vec::new();
    for i in 0..32_i64 {
        let dispatcher = Arc::clone(&dispatcher);
        tasks.push(tokio::spawn(async move {
            let text = format!("message-{i}");
            let response = dispatcher
                .dispatch(
                    RequestEnvelope {
                        capability: "echo".to_string(),
                        arguments: json!({"text": text}),
                        id: RequestId::Number(i),
                    },
                    RequestContext::detached(RequestId::Number(i)),
                )
                .await;
            (i, response)
        }));
    }

    for task in tasks {
        let (i, response) = task.await.unwrap();
        assert!(response.ok);
        assert_eq!(response.id, Some(RequestId::Number(i)));
        assert_eq!(
            response.output,
            Some(json!({"text": format!("message-{i}")}))
        );
    }
}

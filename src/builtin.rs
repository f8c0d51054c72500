//! Built-in demonstration capabilities.
//!
//! `echo` exercises the schema-validated round trip; `delay` holds a
//! dispatch open for a requested duration while observing cooperative
//! cancellation. Both are registered by the binary so a freshly started
//! server is immediately usable.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::DomainError;
use crate::registry::{handler_fn, Capability, CapabilityRegistry, RegistryError};
use crate::schema::Schema;

/// Registers the built-in capabilities.
///
/// # Errors
///
/// Returns [`RegistryError::DuplicateCapability`] if a name is already
/// taken.
pub fn register_builtin(registry: &mut CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register(echo_capability())?;
    registry.register(delay_capability())?;
    Ok(())
}

/// Returns the supplied text unchanged.
#[must_use]
pub fn echo_capability() -> Capability {
    Capability::new(
        "echo",
        Schema::object()
            .property("text", Schema::string().describe("Text to echo back"))
            .required(["text"]),
        Schema::object().property("text", Schema::string()),
        handler_fn(|_context, arguments| async move { Ok(arguments) }),
    )
    .with_description("Returns the supplied text unchanged")
}

/// Waits for the requested duration before responding.
#[must_use]
pub fn delay_capability() -> Capability {
    Capability::new(
        "delay",
        Schema::object().property(
            "duration_ms",
            Schema::integer()
                .minimum(0)
                .maximum(60_000)
                .default_value(json!(1_000))
                .describe("How long to wait before responding, in milliseconds"),
        ),
        Schema::object().property("slept_ms", Schema::integer()),
        handler_fn(|context, arguments| async move {
            let duration_ms = arguments
                .get("duration_ms")
                .and_then(Value::as_u64)
                .unwrap_or(1_000);

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    Ok(json!({"slept_ms": duration_ms}))
                }
                () = context.cancelled() => {
                    Err(DomainError::new("delay cancelled before completion"))
                }
            }
        }),
    )
    .with_description("Waits for the requested duration, observing cancellation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use crate::registry::RequestContext;
    use tokio::sync::watch;

    #[test]
    fn builtin_registration_succeeds() {
        let mut registry = CapabilityRegistry::new();
        register_builtin(&mut registry).unwrap();
        assert!(registry.resolve("echo").is_some());
        assert!(registry.resolve("delay").is_some());
    }

    #[tokio::test]
    async fn echo_round_trips_conformed_arguments() {
        let capability = echo_capability();
        let arguments = capability
            .input_schema()
            .conform(json!({"text": "hi"}))
            .unwrap();

        let context = RequestContext::detached(RequestId::Number(1));
        let output = capability.invoke(&context, arguments).await.unwrap();
        assert_eq!(output, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn delay_defaults_to_one_second() {
        let capability = delay_capability();
        let conformed = capability.input_schema().conform(json!({})).unwrap();
        assert_eq!(conformed["duration_ms"], json!(1_000));
    }

    #[tokio::test]
    async fn delay_completes_after_requested_duration() {
        let capability = delay_capability();
        let context = RequestContext::detached(RequestId::Number(1));
        let output = capability
            .invoke(&context, json!({"duration_ms": 5}))
            .await
            .unwrap();
        assert_eq!(output, json!({"slept_ms": 5}));
    }

    #[tokio::test]
    async fn delay_observes_cancellation() {
        let capability = delay_capability();
        let (tx, rx) = watch::channel(false);
        let context = RequestContext::new(RequestId::Number(1), rx);

        let invocation = tokio::spawn(async move {
            capability
                .invoke(&context, json!({"duration_ms": 30_000}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(true);

        let result = invocation.await.unwrap();
        let err = result.unwrap_err();
        assert!(err.message.contains("cancelled"));
    }
}

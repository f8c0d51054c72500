//! Capability registration and the handler contract.
//!
//! A [`Capability`] pairs a unique name with declared input/output schemas
//! and an opaque [`Handler`]. The [`CapabilityRegistry`] is populated once
//! during startup, single-threaded, before any transport accepts traffic;
//! after that it is shared read-only behind an `Arc` and resolved
//! concurrently without locking.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::DomainError;
use crate::protocol::RequestId;
use crate::schema::Schema;

/// Per-request state handed to handlers.
///
/// Carries the correlation token and a cancellation receiver. Cancellation
/// is cooperative: handlers should observe [`RequestContext::cancelled`] at
/// their suspension points and wind down promptly, but are not forcibly
/// terminated before the shutdown grace deadline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    cancel: watch::Receiver<bool>,
}

impl RequestContext {
    /// Creates a context wired to the given cancellation receiver.
    #[must_use]
    pub const fn new(request_id: RequestId, cancel: watch::Receiver<bool>) -> Self {
        Self {
            request_id,
            cancel,
        }
    }

    /// Creates a context that is never cancelled. Useful for tests and
    /// direct invocations outside a transport.
    #[must_use]
    pub fn detached(request_id: RequestId) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(request_id, rx)
    }

    /// The correlation token of the originating request.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if the request outlives its cancellation source
    /// without being cancelled.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Cancellation source dropped without firing.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The capability handler contract.
///
/// Handlers receive schema-conformed arguments and return either a typed
/// output value or a domain error. They must not block indefinitely without
/// observing the context's cancellation, and must never write to the
/// process's primary output channel (the line transport owns it).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Executes the capability's logic.
    async fn handle(
        &self,
        context: &RequestContext,
        arguments: Value,
    ) -> Result<Value, DomainError>;
}

struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    async fn handle(
        &self,
        context: &RequestContext,
        arguments: Value,
    ) -> Result<Value, DomainError> {
        (self.func)(context.clone(), arguments).await
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn Handler>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    Arc::new(FnHandler {
        func,
    })
}

/// A named, independently invocable unit of server functionality.
///
/// Immutable after registration.
#[derive(Clone)]
pub struct Capability {
    name: String,
    description: Option<String>,
    input_schema: Schema,
    output_schema: Schema,
    handler: Arc<dyn Handler>,
}

impl Capability {
    /// Creates a new capability.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema,
            output_schema,
            handler,
        }
    }

    /// Attaches a human-readable description.
    #[must_use]
    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// The capability's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared input schema.
    #[must_use]
    pub const fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    /// The declared output schema.
    #[must_use]
    pub const fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    /// Invokes the handler with conformed arguments.
    ///
    /// # Errors
    ///
    /// Returns the handler's domain error unchanged.
    pub async fn invoke(
        &self,
        context: &RequestContext,
        arguments: Value,
    ) -> Result<Value, DomainError> {
        self.handler.handle(context, arguments).await
    }

    /// Renders the capability for listings.
    #[must_use]
    pub fn definition(&self) -> CapabilityDefinition {
        CapabilityDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.to_value(),
            output_schema: self.output_schema.to_value(),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A serialisable capability description for listing endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDefinition {
    /// Unique capability name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema rendered as a JSON value.
    pub input_schema: Value,
    /// Output schema rendered as a JSON value.
    pub output_schema: Value,
}

/// Registration errors. Fatal at startup, never raised at runtime.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A capability was registered twice under the same name.
    #[error("duplicate capability registration: {name}")]
    DuplicateCapability {
        /// The conflicting name.
        name: String,
    },
}

/// The capability table, frozen after startup.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: IndexMap<String, Arc<Capability>>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateCapability`] if the name is already
    /// registered. This is a configuration error; the server must not start.
    pub fn register(&mut self, capability: Capability) -> Result<(), RegistryError> {
        let name = capability.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability {
                name,
            });
        }
        self.entries.insert(name, Arc::new(capability));
        Ok(())
    }

    /// Resolves a capability by name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<Capability>> {
        self.entries.get(name).cloned()
    }

    /// Returns capability definitions in registration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<CapabilityDefinition> {
        self.entries
            .values()
            .map(|capability| capability.definition())
            .collect()
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trivial(name: &str) -> Capability {
        Capability::new(
            name,
            Schema::object(),
            Schema::object(),
            handler_fn(|_context, arguments| async move { Ok(arguments) }),
        )
    }

    #[test]
    fn resolve_returns_registered_capability() {
        let mut registry = CapabilityRegistry::new();
        registry.register(trivial("echo")).unwrap();

        let capability = registry.resolve("echo").unwrap();
        assert_eq!(capability.name(), "echo");
    }

    #[test]
    fn resolve_unregistered_name_is_none() {
        let registry = CapabilityRegistry::new();
        assert!(registry.resolve("ghost").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = CapabilityRegistry::new();
        registry.register(trivial("echo")).unwrap();

        let err = registry.register(trivial("echo")).unwrap_err();
        let RegistryError::DuplicateCapability {
            name,
        } = err;
        assert_eq!(name, "echo");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn definitions_preserve_registration_order() {
        let mut registry = CapabilityRegistry::new();
        registry.register(trivial("zulu")).unwrap();
        registry.register(trivial("alpha")).unwrap();

        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|definition| definition.name)
            .collect();
        assert_eq!(names, vec!["zulu", "alpha"]);
    }

    #[tokio::test]
    async fn handler_fn_invokes_closure() {
        let capability = Capability::new(
            "double",
            Schema::object(),
            Schema::object(),
            handler_fn(|_context, arguments| async move {
                let n = arguments["n"].as_i64().unwrap_or(0);
                Ok(json!({"n": n * 2}))
            }),
        );

        let context = RequestContext::detached(RequestId::Number(1));
        let output = capability.invoke(&context, json!({"n": 21})).await.unwrap();
        assert_eq!(output, json!({"n": 42}));
    }

    #[tokio::test]
    async fn detached_context_is_never_cancelled() {
        let context = RequestContext::detached(RequestId::Number(1));
        assert!(!context.is_cancelled());

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            context.cancelled(),
        )
        .await;
        assert!(cancelled.is_err(), "detached context must not cancel");
    }

    #[tokio::test]
    async fn context_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        let context = RequestContext::new(RequestId::Number(1), rx);
        assert!(!context.is_cancelled());

        tx.send_replace(true);
        assert!(context.is_cancelled());
        context.cancelled().await;
    }
}

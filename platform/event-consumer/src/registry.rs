//! Explicit `eventType` → handler registration

use async_trait::async_trait;
use event_bus::EventEnvelope;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::context::EventContext;

/// Why a handler invocation failed
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (downstream unavailable, lock contention, ...)
    #[error("transient handler error: {0}")]
    Transient(String),

    /// Retrying cannot help; goes straight to the dead-letter sink
    #[error("permanent handler error: {0}")]
    Permanent(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn transient(message: impl std::fmt::Display) -> Self {
        HandlerError::Transient(message.to_string())
    }

    pub fn permanent(message: impl std::fmt::Display) -> Self {
        HandlerError::Permanent(message.to_string())
    }

    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HandlerError::Other(Box::new(error))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Permanent(_))
    }
}

/// Business logic for one event type
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &EventContext,
        envelope: &EventEnvelope<Value>,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(
        &self,
        ctx: &EventContext,
        envelope: &EventEnvelope<Value>,
    ) -> Result<(), HandlerError> {
        (**self).handle(ctx, envelope).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventContext, EventEnvelope<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventContext, EventEnvelope<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        ctx: &EventContext,
        envelope: &EventEnvelope<Value>,
    ) -> Result<(), HandlerError> {
        (self.0)(ctx.clone(), envelope.clone()).await
    }
}

/// Decodes the payload into `P` before calling the closure
struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> EventHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(EventContext, EventEnvelope<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        ctx: &EventContext,
        envelope: &EventEnvelope<Value>,
    ) -> Result<(), HandlerError> {
        let typed = envelope.decode_payload::<P>().map_err(|e| {
            HandlerError::permanent(format!(
                "payload does not decode as {}: {}",
                std::any::type_name::<P>(),
                e
            ))
        })?;
        (self.f)(ctx.clone(), typed).await
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler for event type '{0}' is already registered")]
    Duplicate(String),

    #[error("event type cannot be empty")]
    EmptyEventType,

    #[error("at least one event type is required")]
    NoEventTypes,
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub handler: Arc<dyn EventHandler>,
    /// Overrides the runtime's default handler timeout
    pub timeout: Option<Duration>,
}

/// Handlers keyed by `eventType`
///
/// Registration is explicit and happens before the runtime starts; there is
/// no discovery and no wildcard matching.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, event_type: &str, handler: H) -> Result<(), RegistryError>
    where
        H: EventHandler + 'static,
    {
        self.insert(event_type, Arc::new(handler), None)
    }

    /// Register one handler for several event types
    ///
    /// The call is all or nothing: if any type is empty, repeated, or already
    /// registered, nothing is added.
    pub fn register_many<'a, I, H>(&mut self, event_types: I, handler: H) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = &'a str>,
        H: EventHandler + 'static,
    {
        let event_types: Vec<&str> = event_types.into_iter().collect();
        if event_types.is_empty() {
            return Err(RegistryError::NoEventTypes);
        }

        let mut seen = HashSet::new();
        for event_type in &event_types {
            self.check_available(event_type)?;
            if !seen.insert(*event_type) {
                return Err(RegistryError::Duplicate(event_type.to_string()));
            }
        }

        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        for event_type in event_types {
            self.insert(event_type, handler.clone(), None)?;
        }
        Ok(())
    }

    /// Register with a handler-specific invocation timeout
    pub fn register_with_timeout<H>(
        &mut self,
        event_type: &str,
        handler: H,
        timeout: Duration,
    ) -> Result<(), RegistryError>
    where
        H: EventHandler + 'static,
    {
        self.insert(event_type, Arc::new(handler), Some(timeout))
    }

    /// Register a closure over a typed payload
    ///
    /// A payload that does not decode as `P` is a permanent handler error.
    pub fn register_typed<P, F, Fut>(&mut self, event_type: &str, f: F) -> Result<(), RegistryError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(EventContext, EventEnvelope<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = TypedHandler {
            f,
            _payload: PhantomData,
        };
        self.insert(event_type, Arc::new(handler), None)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, event_type: &str) -> Option<&Registration> {
        self.handlers.get(event_type)
    }

    fn insert(
        &mut self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        timeout: Option<Duration>,
    ) -> Result<(), RegistryError> {
        self.check_available(event_type)?;
        self.handlers
            .insert(event_type.to_string(), Registration { handler, timeout });
        Ok(())
    }

    fn check_available(&self, event_type: &str) -> Result<(), RegistryError> {
        if event_type.trim().is_empty() {
            return Err(RegistryError::EmptyEventType);
        }
        if self.handlers.contains_key(event_type) {
            return Err(RegistryError::Duplicate(event_type.to_string()));
        }
        Ok(())
    }
}

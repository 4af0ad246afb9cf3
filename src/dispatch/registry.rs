//! # Integration Event Handler Registry
//!
//! Explicit map from event-type tag to its single handler, built once at
//! startup and frozen into an [`IntegrationEventDispatcher`](super::IntegrationEventDispatcher).
//!
//! ```rust
//! use outbox_core::dispatch::{
//!     IntegrationEventDispatcher, IntegrationEventHandlingResult, IntegrationEventRegistry,
//! };
//! use outbox_core::models::IntegrationEvent;
//! use outbox_core::messaging::BrokerEnvelope;
//! use serde_json::{json, Value};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use uuid::Uuid;
//!
//! # tokio_test::block_on(async {
//! let mut registry = IntegrationEventRegistry::new();
//! registry
//!     .register_fn("TaskCreated", |_event: IntegrationEvent<Value>| async {
//!         IntegrationEventHandlingResult::Success
//!     })
//!     .unwrap();
//! assert!(registry.register_fn("TaskCreated", |_event: IntegrationEvent<Value>| async {
//!     IntegrationEventHandlingResult::Success
//! }).is_err());
//!
//! let dispatcher = IntegrationEventDispatcher::new(registry, Duration::from_secs(5));
//! let envelope = BrokerEnvelope {
//!     message_id: Uuid::new_v4(),
//!     message_type: "TaskCreated".to_string(),
//!     routing_key: None,
//!     deduplication_key: Some("task-123-created".to_string()),
//!     payload: serde_json::to_value(IntegrationEvent::new(json!({"task_id": "123"}))).unwrap(),
//!     published_at: chrono::Utc::now(),
//! };
//! let result = dispatcher.dispatch(&envelope, &CancellationToken::new()).await;
//! assert!(result.is_success());
//! # });
//! ```

use super::result::IntegrationEventHandlingResult;
use crate::error::{OutboxError, OutboxResult};
use crate::messaging::BrokerEnvelope;
use crate::models::IntegrationEvent;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

/// Handles one integration event type
#[async_trait]
pub trait IntegrationEventHandler: Send + Sync {
    async fn handle(&self, envelope: &BrokerEnvelope) -> IntegrationEventHandlingResult;
}

/// Adapts an async closure over a typed event body into a handler.
///
/// A payload that does not deserialize into `E` is a permanent failure.
pub struct TypedEventHandler<E, F> {
    handler: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F> TypedEventHandler<E, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F, Fut> IntegrationEventHandler for TypedEventHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(IntegrationEvent<E>) -> Fut + Send + Sync,
    Fut: Future<Output = IntegrationEventHandlingResult> + Send + 'static,
{
    async fn handle(&self, envelope: &BrokerEnvelope) -> IntegrationEventHandlingResult {
        match serde_json::from_value::<IntegrationEvent<E>>(envelope.payload.clone()) {
            Ok(event) => (self.handler)(event).await,
            Err(e) => IntegrationEventHandlingResult::permanent(format!(
                "payload does not match {}: {e}",
                envelope.message_type
            )),
        }
    }
}

#[derive(Default, Clone)]
pub struct IntegrationEventRegistry {
    handlers: HashMap<String, Arc<dyn IntegrationEventHandler>>,
}

impl std::fmt::Debug for IntegrationEventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationEventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl IntegrationEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `event_type`; a second registration is an error
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn IntegrationEventHandler>,
    ) -> OutboxResult<()> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(OutboxError::registration("event type must not be empty"));
        }
        if self.handlers.contains_key(&event_type) {
            return Err(OutboxError::registration(format!(
                "handler already registered for {event_type}"
            )));
        }

        info!(event_type = %event_type, "Registered integration event handler");
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Register an async closure over the typed event body
    pub fn register_fn<E, F, Fut>(&mut self, event_type: impl Into<String>, handler: F) -> OutboxResult<()>
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(IntegrationEvent<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IntegrationEventHandlingResult> + Send + 'static,
    {
        self.register(event_type, Arc::new(TypedEventHandler::<E, F>::new(handler)))
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn IntegrationEventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, sorted
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

    pub(crate) fn into_handlers(self) -> HashMap<String, Arc<dyn IntegrationEventHandler>> {
        self.handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct TaskCreated {
        task_id: String,
    }

    fn envelope(message_type: &str, payload: serde_json::Value) -> BrokerEnvelope {
        let message = crate::models::NewOutboxMessage::new(message_type, payload.to_string())
            .into_message(chrono::Utc::now());
        BrokerEnvelope::from_outbox(&message).unwrap()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = IntegrationEventRegistry::new();
        registry
            .register_fn("TaskCreated", |_: IntegrationEvent<TaskCreated>| async {
                IntegrationEventHandlingResult::Success
            })
            .unwrap();

        let err = registry
            .register_fn("TaskCreated", |_: IntegrationEvent<TaskCreated>| async {
                IntegrationEventHandlingResult::Success
            })
            .unwrap_err();
        assert!(matches!(err, OutboxError::Registration { .. }));
        assert_eq!(registry.event_types(), vec!["TaskCreated"]);
    }

    #[tokio::test]
    async fn test_typed_handler_receives_body() {
        let handler = TypedEventHandler::new(|event: IntegrationEvent<TaskCreated>| async move {
            if event.data.task_id == "123" {
                IntegrationEventHandlingResult::Success
            } else {
                IntegrationEventHandlingResult::permanent("wrong task")
            }
        });

        let event = IntegrationEvent::new(json!({"task_id": "123"}));
        let ok = envelope("TaskCreated", serde_json::to_value(&event).unwrap());
        assert!(handler.handle(&ok).await.is_success());

        let malformed = envelope("TaskCreated", json!({"unexpected": true}));
        assert!(matches!(
            handler.handle(&malformed).await,
            IntegrationEventHandlingResult::PermanentFailure(_)
        ));
    }
}

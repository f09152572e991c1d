//! Typed handlers and the adapter that erases them to `DeliveryHandler`.

use std::marker::PhantomData;

use anyhow::Context;
use async_trait::async_trait;

use super::event::Event;
use crate::domain::EventType;
use crate::ports::DeliveryHandler;

/// Handles one concrete event type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Decodes the opaque payload into `E`, then calls the typed handler.
///
/// A payload that does not decode is a delivery failure like any other.
pub struct TypedHandler<E: Event, H: EventHandler<E>> {
    handler: H,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event, H: EventHandler<E>> TypedHandler<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> DeliveryHandler for TypedHandler<E, H> {
    async fn deliver(
        &self,
        event_type: &EventType,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let event: E = serde_json::from_value(payload.clone())
            .with_context(|| format!("decode {event_type} payload"))?;
        self.handler.handle(event).await
    }
}

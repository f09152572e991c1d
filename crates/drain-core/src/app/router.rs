//! Router - event_type -> DeliveryHandler.
//!
//! Built once at startup, read-only afterwards. No locks, no runtime
//! re-registration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::EventType;
use crate::error::DeliveryError;
use crate::ports::DeliveryHandler;
use crate::typed::{Event, EventHandler, TypedHandler};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("handler for event_type '{0}' is already registered")]
    AlreadyRegistered(EventType),
}

/// Static routing table.
#[derive(Default)]
pub struct Router {
    routes: HashMap<EventType, Arc<dyn DeliveryHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Register a handler. A second registration for the same type is an error.
    pub fn register(
        &mut self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), RouterError> {
        let event_type = event_type.into();
        if self.routes.contains_key(&event_type) {
            return Err(RouterError::AlreadyRegistered(event_type));
        }
        self.routes.insert(event_type, handler);
        Ok(())
    }

    /// Register a typed handler under `E::TYPE`.
    pub fn register_typed<E, H>(&mut self, handler: H) -> Result<(), RouterError>
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.register(E::TYPE, Arc::new(TypedHandler::<E, H>::new(handler)))
    }

    pub fn get(&self, event_type: &EventType) -> Option<&Arc<dyn DeliveryHandler>> {
        self.routes.get(event_type)
    }

    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver one event.
    ///
    /// An unknown event type fails like any handler error: it is retried and
    /// eventually dead-lettered. There is no separate "unroutable" state.
    pub async fn deliver(
        &self,
        event_type: &EventType,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let handler = self
            .routes
            .get(event_type)
            .ok_or_else(|| DeliveryError::Unroutable(event_type.clone()))?;

        handler.deliver(event_type, payload).await?;
        Ok(())
    }
}

/// BuildError - the router is missing event types the host said it needs.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("missing handlers for event types: {0:?}")]
    MissingEventTypes(Vec<EventType>),
}

/// Fail-fast router construction.
///
/// ```ignore
/// let router = Router::builder()
///     .route("incident.created", Arc::new(notifier))
///     .expect_event_types(&["incident.created"])
///     .build()?;
/// ```
pub struct RouterBuilder {
    router: Router,
    error: Option<RouterError>,
    expected: Vec<EventType>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            error: None,
            expected: Vec::new(),
        }
    }

    /// Add a route. A duplicate is reported by `build()`.
    pub fn route(
        mut self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        if self.error.is_none()
            && let Err(e) = self.router.register(event_type, handler)
        {
            self.error = Some(e);
        }
        self
    }

    pub fn typed_route<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        if self.error.is_none()
            && let Err(e) = self.router.register_typed::<E, H>(handler)
        {
            self.error = Some(e);
        }
        self
    }

    pub fn expect_event_types(mut self, event_types: &[&str]) -> Self {
        self.expected = event_types.iter().map(|t| EventType::new(*t)).collect();
        self
    }

    pub fn build(self) -> Result<Router, BuildError> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        let missing: Vec<EventType> = self
            .expected
            .into_iter()
            .filter(|t| self.router.get(t).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingEventTypes(missing));
        }
        Ok(self.router)
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

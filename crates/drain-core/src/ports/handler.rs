//! DeliveryHandler port - the injected "deliver this event" capability.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::EventType;

/// Delivers one event downstream (notifier call, live broadcast, ...).
///
/// Must be idempotent: a crash between the external effect and the row's
/// deletion means the same event is delivered again. Any `Err` counts as a
/// failed attempt, whatever its cause.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(
        &self,
        event_type: &EventType,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`DeliveryHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// ```ignore
/// let h = handler_fn(|event_type, payload| async move {
///     tracing::info!(%event_type, %payload, "delivered");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventType, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(EventType, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn deliver(
        &self,
        event_type: &EventType,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        (self.f)(event_type.clone(), payload.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closure_handler_receives_event_and_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = handler_fn(move |event_type, payload| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(event_type.as_str(), "incident.created");
                assert_eq!(payload["id"], 42);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler
            .deliver(&EventType::new("incident.created"), &serde_json::json!({"id": 42}))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closure_handler_error_is_returned() {
        let handler = handler_fn(|_, _| async { Err(anyhow::anyhow!("notifier returned 503")) });
        let err = handler
            .deliver(&EventType::new("x"), &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "notifier returned 503");
    }
}

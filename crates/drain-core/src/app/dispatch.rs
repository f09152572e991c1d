//! Dispatcher - deliver one claimed row and persist what happened.
//!
//! Flow per row:
//! 1. wait for a concurrency permit
//! 2. Router::deliver (handler panics are caught and count as failures)
//! 3. success -> delete, failure -> RetryPolicy decides reschedule or dead
//!
//! A failed status update is logged and leaves the row in `processing`.
//! Every update carries the row's claim token; if the row was requeued and
//! claimed again meanwhile, the update is dropped and the newer claim wins.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::app::retry::{FailureAction, RetryPolicy};
use crate::app::router::Router;
use crate::domain::{ClaimToken, OutboxRecord, truncate_error};
use crate::error::{DeliveryError, DrainError, DrainResult, StoreError};
use crate::ports::OutboxStore;

/// How a claimed row left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Handler succeeded, row deleted.
    Delivered,
    /// Back to `pending` as retry number `attempt`.
    Retried { attempt: u32 },
    /// Moved to `dead`.
    DeadLettered,
    /// Status update failed; row stuck in `processing`.
    Orphaned,
    /// Claim lost to a requeue before the outcome was written; the row
    /// belongs to another delivery now.
    Superseded,
}

/// Cheap to clone; one clone per spawned delivery task.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    router: Arc<Router>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        router: Arc<Router>,
        retry: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            router,
            retry,
            permits: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Deliver `row` and record the outcome.
    ///
    /// Only control-logic breakage is returned as an error; every delivery
    /// or persistence failure is folded into the returned [`RowOutcome`].
    #[tracing::instrument(skip_all, fields(outbox_id = %row.id, event_type = %row.event_type))]
    pub async fn dispatch(&self, row: OutboxRecord) -> DrainResult<RowOutcome> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DrainError::LoopFatal("delivery semaphore closed".into()))?;

        let delivered = AssertUnwindSafe(self.router.deliver(&row.event_type, &row.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DeliveryError::Panicked(panic_message(&*panic))));

        let persisted = match delivered {
            Ok(()) => self.on_success(row.claim_token()).await,
            Err(err) => self.on_failure(&row, &err).await,
        };

        Ok(persisted.unwrap_or_else(|err| {
            error!(error = %err, "outbox row left in processing");
            RowOutcome::Orphaned
        }))
    }

    async fn on_success(&self, claim: ClaimToken) -> DrainResult<RowOutcome> {
        let deleted = self.store.delete(claim).await.map_err(|source| DrainError::Persistence {
            id: claim.id,
            source,
        })?;
        if !deleted {
            warn!("outbox claim superseded, delete skipped");
            return Ok(RowOutcome::Superseded);
        }
        debug!("outbox delivered -> deleted");
        Ok(RowOutcome::Delivered)
    }

    async fn on_failure(&self, row: &OutboxRecord, err: &DeliveryError) -> DrainResult<RowOutcome> {
        let claim = row.claim_token();
        let persistence = |source: StoreError| DrainError::Persistence {
            id: claim.id,
            source,
        };
        let last_error = truncate_error(&err.to_string());

        match self.retry.on_failure(row.attempts) {
            FailureAction::DeadLetter => {
                let marked = self
                    .store
                    .mark_dead(claim, &last_error)
                    .await
                    .map_err(persistence)?;
                if !marked {
                    warn!(error = %err, "outbox claim superseded, dead-letter skipped");
                    return Ok(RowOutcome::Superseded);
                }
                error!(retries = row.attempts, error = %err, "outbox DEAD");
                Ok(RowOutcome::DeadLettered)
            }
            FailureAction::Retry { attempt, delay } => {
                let rescheduled = self
                    .store
                    .reschedule(claim, delay, &last_error)
                    .await
                    .map_err(persistence)?;
                if !rescheduled {
                    warn!(error = %err, "outbox claim superseded, retry skipped");
                    return Ok(RowOutcome::Superseded);
                }
                warn!(
                    retry = attempt,
                    delay_s = delay.as_secs_f64(),
                    error = %err,
                    "outbox retry scheduled"
                );
                Ok(RowOutcome::Retried { attempt })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, OutboxStatus};
    use crate::impls::InMemoryOutboxStore;
    use crate::ports::{Clock, DeliveryHandler, FixedClock, handler_fn};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()))
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter: Duration::ZERO,
        }
    }

    fn router_with(event_type: &str, handler: Arc<dyn DeliveryHandler>) -> Arc<Router> {
        let mut router = Router::new();
        router.register(event_type, handler).unwrap();
        Arc::new(router)
    }

    async fn claim_one(store: &InMemoryOutboxStore) -> OutboxRecord {
        let mut rows = store.claim_batch(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        rows.remove(0)
    }

    #[tokio::test]
    async fn success_deletes_the_row() {
        let store = Arc::new(InMemoryOutboxStore::new(clock()));
        store.insert("incident.created", serde_json::json!({"id": 1})).await;
        let router = router_with("incident.created", Arc::new(handler_fn(|_, _| async { Ok(()) })));
        let dispatcher = Dispatcher::new(store.clone(), router, policy(5), 1);

        let row = claim_one(&store).await;
        let outcome = dispatcher.dispatch(row).await.unwrap();

        assert_eq!(outcome, RowOutcome::Delivered);
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff_and_error() {
        let clock = clock();
        let store = Arc::new(InMemoryOutboxStore::new(clock.clone()));
        let id = store.insert("incident.created", serde_json::json!({})).await;
        let router = router_with(
            "incident.created",
            Arc::new(handler_fn(|_, _| async { Err(anyhow::anyhow!("notifier 503")) })),
        );
        let dispatcher = Dispatcher::new(store.clone(), router, policy(5), 1);

        let row = claim_one(&store).await;
        let outcome = dispatcher.dispatch(row).await.unwrap();

        assert_eq!(outcome, RowOutcome::Retried { attempt: 1 });
        let row = store.get(id).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("notifier 503"));
        assert!(row.available_at >= clock.now() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_without_counting() {
        let store = Arc::new(InMemoryOutboxStore::new(clock()));
        let id = store.insert("x", serde_json::json!({})).await;
        let router = router_with("x", Arc::new(handler_fn(|_, _| async { Err(anyhow::anyhow!("boom")) })));
        let dispatcher = Dispatcher::new(store.clone(), router, policy(0), 1);

        let row = claim_one(&store).await;
        let outcome = dispatcher.dispatch(row).await.unwrap();

        assert_eq!(outcome, RowOutcome::DeadLettered);
        let row = store.get(id).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Dead);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let store = Arc::new(InMemoryOutboxStore::new(clock()));
        let id = store.insert("x", serde_json::json!({})).await;
        let router = router_with(
            "x",
            Arc::new(handler_fn(|_, payload| async move {
                if payload.is_object() {
                    panic!("handler bug");
                }
                Ok(())
            })),
        );
        let dispatcher = Dispatcher::new(store.clone(), router, policy(5), 1);

        let row = claim_one(&store).await;
        let outcome = dispatcher.dispatch(row).await.unwrap();

        assert_eq!(outcome, RowOutcome::Retried { attempt: 1 });
        let row = store.get(id).await.unwrap();
        assert_eq!(row.last_error.as_deref(), Some("handler panicked: handler bug"));
    }

    #[tokio::test]
    async fn long_errors_are_truncated_before_storing() {
        let store = Arc::new(InMemoryOutboxStore::new(clock()));
        let id = store.insert("x", serde_json::json!({})).await;
        let router = router_with(
            "x",
            Arc::new(handler_fn(|_, _| async { Err(anyhow::anyhow!("e".repeat(2_000))) })),
        );
        let dispatcher = Dispatcher::new(store.clone(), router, policy(5), 1);

        let row = claim_one(&store).await;
        dispatcher.dispatch(row).await.unwrap();

        let row = store.get(id).await.unwrap();
        assert_eq!(row.last_error.unwrap().len(), crate::domain::LAST_ERROR_MAX_CHARS);
    }

    #[tokio::test]
    async fn outcome_of_a_requeued_claim_is_dropped() {
        let clock = clock();
        let store = Arc::new(InMemoryOutboxStore::new(clock.clone()));
        let id = store.insert("x", serde_json::json!({})).await;
        let stale = claim_one(&store).await;

        clock.advance(chrono::Duration::minutes(10));
        store.requeue_stale(Duration::from_secs(60)).await.unwrap();
        let current = claim_one(&store).await;

        let failing = router_with("x", Arc::new(handler_fn(|_, _| async { Err(anyhow::anyhow!("late")) })));
        let dispatcher = Dispatcher::new(store.clone(), failing, policy(5), 1);
        assert_eq!(dispatcher.dispatch(stale.clone()).await.unwrap(), RowOutcome::Superseded);

        let succeeding = router_with("x", Arc::new(handler_fn(|_, _| async { Ok(()) })));
        let dispatcher = Dispatcher::new(store.clone(), succeeding, policy(5), 1);
        assert_eq!(dispatcher.dispatch(stale).await.unwrap(), RowOutcome::Superseded);

        let row = store.get(id).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Processing);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.last_error, None);
        assert_eq!(row.claim_token(), current.claim_token());

        assert_eq!(dispatcher.dispatch(current).await.unwrap(), RowOutcome::Delivered);
        assert!(store.get(id).await.is_none());
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_permits() {
        let store = Arc::new(InMemoryOutboxStore::new(clock()));
        for _ in 0..6 {
            store.insert("slow", serde_json::json!({})).await;
        }

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let router = router_with(
            "slow",
            Arc::new(handler_fn(move |_, _| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        );
        let dispatcher = Dispatcher::new(store.clone(), router, policy(5), 2);

        let rows = store.claim_batch(6).await.unwrap();
        let tasks: Vec<_> = rows
            .into_iter()
            .map(|row| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.dispatch(row).await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), RowOutcome::Delivered);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }
}

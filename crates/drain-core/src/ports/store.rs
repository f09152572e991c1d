//! OutboxStore port - the durable queue, seen from the consuming side.
//!
//! Each method is its own atomic unit. Nothing spans a whole batch, so a
//! crash mid-batch can leave some rows deleted, some `processing` and the
//! rest untouched.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ClaimToken, OutboxCounts, OutboxId, OutboxRecord};
use crate::error::StoreError;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically select up to `limit` pending rows whose `available_at` has
    /// passed, ordered by id, skipping rows another claimer holds locked, and
    /// mark them `processing`.
    ///
    /// Returned records carry their pre-claim `attempts`. Two concurrent
    /// calls never return the same id.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Delivery succeeded: remove the row for good.
    ///
    /// This and the two transitions below only touch the row while `claim`
    /// still holds it (`processing` with the same claim stamp). They return
    /// `false` when the claim was lost to a requeue, leaving the row alone.
    async fn delete(&self, claim: ClaimToken) -> Result<bool, StoreError>;

    /// `processing -> pending` with `attempts += 1`, `available_at = now + delay`.
    async fn reschedule(
        &self,
        claim: ClaimToken,
        delay: Duration,
        last_error: &str,
    ) -> Result<bool, StoreError>;

    /// `processing -> dead`. `attempts` is left as is.
    async fn mark_dead(&self, claim: ClaimToken, last_error: &str) -> Result<bool, StoreError>;

    /// Move `processing` rows claimed more than `stale_after` ago back to
    /// `pending`, without counting an attempt. Returns the requeued ids.
    async fn requeue_stale(&self, stale_after: Duration) -> Result<Vec<OutboxId>, StoreError>;

    async fn counts(&self) -> Result<OutboxCounts, StoreError>;

    /// Dead rows, oldest id first.
    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;
}

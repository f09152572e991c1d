//! In-memory outbox store for tests and local runs.
//!
//! The whole table sits behind one async mutex, so a claim is trivially
//! atomic and concurrent claimers partition the pending set just like
//! `FOR UPDATE SKIP LOCKED` does.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{ClaimToken, EventType, OutboxCounts, OutboxId, OutboxRecord, OutboxStatus};
use crate::error::StoreError;
use crate::ports::{Clock, OutboxStore, SystemClock};

struct InMemoryOutboxState {
    /// Keyed by id, so iteration is claim order.
    rows: BTreeMap<OutboxId, OutboxRecord>,

    next_id: i64,
}

impl InMemoryOutboxState {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> OutboxId {
        let id = OutboxId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Row still held by `claim`, if any.
    fn held_mut(&mut self, claim: ClaimToken) -> Option<&mut OutboxRecord> {
        self.rows.get_mut(&claim.id).filter(|row| {
            row.status == OutboxStatus::Processing && row.available_at == claim.claimed_at
        })
    }
}

pub struct InMemoryOutboxStore {
    state: Mutex<InMemoryOutboxState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutboxStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryOutboxState::new()),
            clock,
        }
    }

    /// Producer side: add a pending row, due now.
    pub async fn insert(
        &self,
        event_type: impl Into<EventType>,
        payload: serde_json::Value,
    ) -> OutboxId {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state
            .rows
            .insert(id, OutboxRecord::pending(id, event_type.into(), payload, now));
        id
    }

    pub async fn get(&self, id: OutboxId) -> Option<OutboxRecord> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    /// Every row, in id order.
    pub async fn rows(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let claimed = state
            .rows
            .values_mut()
            .filter(|row| row.is_due(now))
            .take(limit)
            .map(|row| {
                row.status = OutboxStatus::Processing;
                row.available_at = now;
                row.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn delete(&self, claim: ClaimToken) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.held_mut(claim).is_none() {
            return Ok(false);
        }
        state.rows.remove(&claim.id);
        Ok(true)
    }

    async fn reschedule(
        &self,
        claim: ClaimToken,
        delay: Duration,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(row) = state.held_mut(claim) else {
            return Ok(false);
        };
        row.status = OutboxStatus::Pending;
        row.attempts = row.attempts.saturating_add(1);
        row.available_at = after(now, delay);
        row.last_error = Some(last_error.to_string());
        Ok(true)
    }

    async fn mark_dead(&self, claim: ClaimToken, last_error: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.held_mut(claim) else {
            return Ok(false);
        };
        row.status = OutboxStatus::Dead;
        row.last_error = Some(last_error.to_string());
        Ok(true)
    }

    async fn requeue_stale(&self, stale_after: Duration) -> Result<Vec<OutboxId>, StoreError> {
        let now = self.clock.now();
        let cutoff = before(now, stale_after);
        let mut state = self.state.lock().await;

        let requeued = state
            .rows
            .values_mut()
            .filter(|row| row.status == OutboxStatus::Processing && row.available_at <= cutoff)
            .map(|row| {
                row.status = OutboxStatus::Pending;
                row.available_at = now;
                row.id
            })
            .collect();
        Ok(requeued)
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = OutboxCounts::default();
        for row in state.rows.values() {
            match row.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Processing => counts.processing += 1,
                OutboxStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| row.status == OutboxStatus::Dead)
            .take(limit)
            .cloned()
            .collect())
    }
}

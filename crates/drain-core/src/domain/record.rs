//! Outbox record: one durable "event happened" row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventType, OutboxId, OutboxStatus};

/// Upper bound (in characters) for the stored `last_error` diagnostic.
pub const LAST_ERROR_MAX_CHARS: usize = 500;

/// A row of the outbox table.
///
/// The producing transaction creates the row together with its domain write.
/// Every later mutation belongs to the drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub event_type: EventType,

    /// Opaque per-event document. The drain never looks inside.
    pub payload: serde_json::Value,

    pub status: OutboxStatus,

    /// Completed failed delivery cycles. Never decreases.
    pub attempts: u32,

    /// Claimable once `status == Pending` and `available_at <= now`.
    /// While `Processing` it holds the claim time.
    pub available_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Fresh pending row, due immediately.
    pub fn pending(
        id: OutboxId,
        event_type: EventType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type,
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            available_at: now,
            last_error: None,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.available_at <= now
    }

    /// Token for the claim that returned this record. Only meaningful on a
    /// record handed out by `claim_batch`.
    pub fn claim_token(&self) -> ClaimToken {
        ClaimToken {
            id: self.id,
            claimed_at: self.available_at,
        }
    }
}

/// One specific claim of a row: its id plus the `available_at` stamp the
/// claim wrote.
///
/// A row is only requeued once its stamp is older than a non-zero
/// threshold, so the next claim always writes a later stamp. Updates
/// carrying an older token match nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimToken {
    pub id: OutboxId,
    pub claimed_at: DateTime<Utc>,
}

/// Cut a diagnostic message down to [`LAST_ERROR_MAX_CHARS`] characters.
///
/// Counts chars rather than bytes so multi-byte text never splits mid-codepoint.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(LAST_ERROR_MAX_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

//! Outbox row status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted status of an outbox row.
///
/// State transitions:
/// - Pending -> Processing (claimed)
/// - Processing -> (row deleted) on successful delivery
/// - Processing -> Pending when a retry is scheduled
/// - Processing -> Dead once the retry budget is spent
///
/// "Delivered" has no variant: it is represented by the row's absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Waiting for `available_at` to pass, then claimable.
    Pending,

    /// Claimed by exactly one drain worker.
    Processing,

    /// Retry budget exhausted. Kept for manual inspection.
    Dead,
}

impl OutboxStatus {
    /// Column value as stored in the table.
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Dead => "dead",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Dead)
    }

    /// Only pending rows are eligible for a claim (subject to `available_at`).
    pub fn is_claimable(self) -> bool {
        matches!(self, OutboxStatus::Pending)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown outbox status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for OutboxStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

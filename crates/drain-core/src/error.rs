//! Error taxonomy for the drain.
//!
//! - [`DeliveryError`]: one row failed. Always contained and turned into a
//!   retry or dead-letter transition.
//! - [`StoreError`]: the durable store refused or could not be reached.
//! - [`DrainError`]: what the loop and its host see.

use thiserror::Error;

use crate::domain::{EventType, OutboxId};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no handler for event_type={0}")]
    Unroutable(EventType),

    #[error("{0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for DeliveryError {
    fn from(err: anyhow::Error) -> Self {
        // alternate form keeps the whole context chain
        DeliveryError::Handler(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt outbox row {id}: {reason}")]
    Corrupt { id: OutboxId, reason: String },
}

#[derive(Debug, Error)]
pub enum DrainError {
    /// Claim query failed. The loop logs it and retries after `poll_sleep`.
    #[error("claim failed: {0}")]
    Claim(#[source] StoreError),

    /// Post-delivery status update failed. The row stays `processing`.
    #[error("persisting outcome of outbox {id} failed: {source}")]
    Persistence {
        id: OutboxId,
        #[source]
        source: StoreError,
    },

    /// The loop's own control logic broke. Never contained.
    #[error("drain loop failed: {0}")]
    LoopFatal(String),

    #[error("invalid drain config: {0}")]
    Config(String),
}

pub type DrainResult<T> = Result<T, DrainError>;

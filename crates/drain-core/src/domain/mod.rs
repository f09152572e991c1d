//! Domain model for the outbox drain (ids, status, records, counts).

pub mod counts;
pub mod ids;
pub mod record;
pub mod status;

pub use counts::OutboxCounts;
pub use ids::{EventType, OutboxId};
pub use record::{ClaimToken, LAST_ERROR_MAX_CHARS, OutboxRecord, truncate_error};
pub use status::{OutboxStatus, UnknownStatus};

//! App - the drain itself, built from the ports.
//!
//! - **Router**: event_type -> handler
//! - **RetryPolicy**: backoff and the dead-letter decision
//! - **Dispatcher**: one delivery per claimed row, under a semaphore
//! - **OutboxDrain / DrainHandle**: poll loop and lifecycle
//! - **ReaperLoop**: optional stale-processing sweep

pub mod config;
pub mod dispatch;
pub mod drain;
pub mod reaper;
pub mod retry;
pub mod router;

pub use self::config::{DrainConfig, ReapConfig};
pub use self::dispatch::{Dispatcher, RowOutcome};
pub use self::drain::{CycleReport, DrainHandle, OutboxDrain};
pub use self::reaper::ReaperLoop;
pub use self::retry::{FailureAction, MIN_BACKOFF, RetryPolicy};
pub use self::router::{BuildError, Router, RouterBuilder, RouterError};

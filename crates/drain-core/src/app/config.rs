//! Drain configuration.

use std::time::Duration;

use crate::app::retry::RetryPolicy;
use crate::error::{DrainError, DrainResult};

/// Knobs of one drain instance. `Default` matches the incident service.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainConfig {
    /// Sleep after a claim that came back empty (or failed).
    pub poll_sleep: Duration,

    pub max_retries: u32,
    pub base_backoff: Duration,
    pub backoff_factor: f64,
    pub jitter: Duration,

    /// Deliveries running at once within a batch.
    pub max_concurrency: usize,

    /// Rows claimed per cycle.
    pub batch_size: usize,

    /// Stale-processing sweep. `None` leaves orphaned rows alone.
    pub reap: Option<ReapConfig>,
}

/// Sweep for rows stuck in `processing` after a crash or forced stop.
///
/// Anything still running longer than `stale_after` is delivered again, so
/// pick a threshold well above the slowest handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapConfig {
    pub stale_after: Duration,
    pub interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            poll_sleep: Duration::from_secs(1),
            max_retries: retry.max_retries,
            base_backoff: retry.base_backoff,
            backoff_factor: retry.backoff_factor,
            jitter: retry.jitter,
            max_concurrency: 5,
            batch_size: 5,
            reap: None,
        }
    }
}

impl DrainConfig {
    pub fn validate(&self) -> DrainResult<()> {
        if self.max_concurrency == 0 {
            return Err(DrainError::Config("max_concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(DrainError::Config("batch_size must be at least 1".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 0.0 {
            return Err(DrainError::Config(format!(
                "backoff_factor must be a positive number, got {}",
                self.backoff_factor
            )));
        }
        if let Some(reap) = &self.reap {
            if reap.stale_after.is_zero() {
                return Err(DrainError::Config("reap stale_after must be non-zero".into()));
            }
            if reap.interval.is_zero() {
                return Err(DrainError::Config("reap interval must be non-zero".into()));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: self.base_backoff,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
        }
    }
}

//! Retry policy: backoff delays and the retry/dead-letter decision.

use std::time::Duration;

use rand::Rng;

/// Shortest delay ever scheduled, whatever the jitter draws.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// What to do with a row whose delivery just failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureAction {
    /// Back to `pending` as retry number `attempt` (1-based), due after `delay`.
    Retry { attempt: u32, delay: Duration },

    /// Budget spent. `attempts` stays where it was.
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed before a row is dead-lettered.
    pub max_retries: u32,

    /// Delay before the first retry (ignoring jitter).
    pub base_backoff: Duration,

    /// Growth per retry.
    pub backoff_factor: f64,

    /// Uniform jitter in `[-jitter, +jitter]` added to every delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(3),
            backoff_factor: 2.0,
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Decide the transition for a row that failed with `attempts` prior failures.
    pub fn on_failure(&self, attempts: u32) -> FailureAction {
        self.on_failure_with(attempts, &mut rand::thread_rng())
    }

    pub fn on_failure_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> FailureAction {
        let attempt = attempts.saturating_add(1);
        if attempt > self.max_retries {
            FailureAction::DeadLetter
        } else {
            FailureAction::Retry {
                attempt,
                delay: self.backoff_with(attempt, rng),
            }
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `max(1s, base * factor^(attempt-1) + uniform(-jitter, jitter))`
    ///
    /// Example with base=1s, factor=2.0, no jitter:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.base_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);

        let jitter = self.jitter.as_secs_f64();
        let noise = if jitter > 0.0 {
            rng.gen_range(-jitter..=jitter)
        } else {
            0.0
        };

        let secs = (base + noise).max(MIN_BACKOFF.as_secs_f64());
        // huge exponents overflow to inf; from_secs_f64 would panic on that
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

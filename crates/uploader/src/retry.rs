//! Capped exponential backoff shared by chunk sends and the finalize step.

use std::time::Duration;

/// Outcome of consulting the [`RetryPolicy`] after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

/// Retry policy: `delay = min(base_delay * 2^attempt, max_delay)`, retried
/// while `attempt < max_attempts`.
///
/// `attempt` is the 0-based index of the attempt that just failed, so with
/// `max_attempts = 3` an operation is sent at most four times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> RetryDecision {
        let delay = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        RetryDecision {
            retry: attempt < self.max_attempts,
            delay,
        }
    }
}

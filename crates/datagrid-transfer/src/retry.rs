//! Retry budget and backoff.
//!
//! Transient failures re-queue the request with exponential backoff and
//! jitter until the attempt budget is spent; permanent failures never
//! retry. The policy only computes delays, it holds no state per request:
//! the attempt count lives on the persisted request row.

use std::time::Duration;

/// Retry tunables for transient transfer failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed per request, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per subsequent attempt.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Fraction of the delay randomized in either direction, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// True once `attempts` exhausts the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the next attempt, given the number already made.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << shift);
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }
        let spread = capped.mul_f64(self.jitter.min(1.0));
        let low = capped.saturating_sub(spread);
        let jittered = low + spread.mul_f64(2.0 * rand::random::<f64>());
        jittered.min(self.max_delay)
    }
}

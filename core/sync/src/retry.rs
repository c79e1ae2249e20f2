//! Exponential backoff between attempts of a failing operation.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Backoff policy for queued operations.
///
/// The delay before retrying an operation that has already been attempted
/// `r` times is `min(base_delay * 2^r, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for an operation with zero recorded attempts.
    pub base_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Create a new backoff policy.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Set base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculate the delay for a given retry count.
    pub fn delay_for_retries(&self, retries: u32) -> Duration {
        let base = self.base_delay.as_millis();
        if base == 0 {
            return Duration::ZERO;
        }
        let scaled = if retries >= 64 {
            u128::MAX
        } else {
            base.saturating_mul(1u128 << retries)
        };
        let capped = scaled.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Whether an operation last attempted at `last_attempt` with `retries`
    /// recorded attempts may be attempted again at `now`.
    pub fn is_elapsed(
        &self,
        last_attempt: Option<DateTime<Utc>>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_attempt) = last_attempt else {
            return true;
        };
        let Ok(delay) = chrono::Duration::from_std(self.delay_for_retries(retries)) else {
            return false;
        };
        match last_attempt.checked_add_signed(delay) {
            Some(ready_at) => now >= ready_at,
            None => false,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(32))
    }
}

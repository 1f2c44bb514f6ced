//! Retry policy for transient handler failures.

use std::time::Duration;

/// Exponential backoff policy applied to transient failures.
///
/// When a handler returns a transient error, the event is retried
/// according to this policy. After `max_attempts` failures, the event is
/// moved to the dead letter queue.
///
/// # Backoff Calculation
///
/// The delay before retry N is: `min(base_delay * 2^(N-1), max_delay)`
///
/// With defaults (base=1s, max=300s):
/// - Attempt 2: 1s delay
/// - Attempt 3: 2s delay
/// - Attempt 4: 4s delay
/// - Attempt 5: 8s delay (then dead letter)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts before moving to dead letter queue.
    ///
    /// Includes the initial attempt. Default: 5 (1 initial + 4 retries).
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    ///
    /// The delay doubles with each retry. Default: 1 second.
    pub base_delay: Duration,

    /// Maximum delay between retries.
    ///
    /// Caps the exponential growth. Default: 5 minutes.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff duration after the given failed attempt (1-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Returns `true` if another retry should be attempted after the
    /// given failed attempt (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

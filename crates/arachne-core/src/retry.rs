use std::time::Duration;

/// Retry configuration with linear backoff.
///
/// Delay schedule: `attempt * base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(attempt.max(1));
        std::cmp::min(delay, self.max_delay)
    }

    /// Total attempts including the first one.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

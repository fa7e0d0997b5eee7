use std::time::Duration;

/// Bounded linear backoff shared by call retries and channel reconnects.
///
/// The delay before retry `n` (starting at 1) is `delay_ms * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay_ms,
        }
    }

    /// Defaults for remote procedure calls: 2 retries, 1s step.
    pub fn for_calls() -> Self {
        Self::new(2, 1_000)
    }

    /// Defaults for channel reconnection: 3 attempts, 2s step.
    pub fn for_channels() -> Self {
        Self::new(3, 2_000)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Total number of attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_calls()
    }
}

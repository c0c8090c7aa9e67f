use std::time::Duration;

/// Capped exponential backoff used when a realtime connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    ///
    /// A server retry hint wins when it is longer than the computed delay, but
    /// never beyond `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint: Option<Duration>) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        let calculated = self.base_delay.saturating_mul(multiplier);
        let hinted = retry_after_hint.unwrap_or_default();
        calculated.max(hinted).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

use std::time::Duration;

/// Bounded exponential backoff, shared by in-process retries and the
/// broker retry queue.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    /// Short policy for status writes that follow a successful claim.
    pub fn bookkeeping() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 2_000,
            backoff_multiplier: 2,
        }
    }

    /// Delay before the job with the given retry count re-enters the main
    /// queue.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1).saturating_pow(retries);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// A job that has already been requeued `retries` times may be requeued
    /// again only while below the bound.
    pub fn has_attempts_left(&self, retries: u32) -> bool {
        retries < self.max_attempts
    }
}

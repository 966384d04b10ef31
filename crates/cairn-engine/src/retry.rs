//! Retry policy — backoff curve and attempt ceiling.
//!
//! The constants here are policy, not mechanism: the ledger asks the
//! policy for deadlines, callers construct whatever policy fits their
//! link. Nothing in the engine hard-codes these numbers.

use std::time::Duration;

use cairn_core::config::RetryConfig;

/// How pending transfers are re-attempted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a transfer is permanently failed.
    pub max_attempts: u32,
    /// Delay after the first attempt. Doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before the next attempt, given how many attempts have been
    /// made so far. Exponential, capped at `max_backoff`.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        // 2^(n-1) with the exponent clamped well below overflow territory.
        let exponent = attempt_count.saturating_sub(1).min(16);
        let factor = 2u32.saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

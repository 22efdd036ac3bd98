//! Bounded exponential backoff for transport reconnects

use crate::config::RetryConfig;
use std::time::Duration;

/// Tracks consecutive failures and hands out growing delays
///
/// Once `max_retries` delays have been handed out without a `reset`,
/// `next_delay` returns `None` and the caller should give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempts: u32,
}

impl Backoff {
    /// Create a new backoff from a retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` when the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_retries {
            return None;
        }

        let factor = self.config.multiplier.powi(self.attempts as i32);
        let millis = (self.config.initial_backoff_ms as f64 * factor)
            .min(self.config.max_backoff_ms as f64);
        self.attempts += 1;

        Some(Duration::from_millis(millis as u64))
    }

    /// Sleep for the next delay; returns false when the budget is spent
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }

    /// Forget past failures after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of consecutive failures seen so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

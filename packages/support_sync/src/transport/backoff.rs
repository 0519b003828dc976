use std::time::Duration;

use crate::config::TransportConfig;

/// Exponential reconnect schedule: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
            max_attempts,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.reconnect_initial(),
            config.reconnect_max(),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the next attempt, or `None` once the attempt limit is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|limit| self.attempt >= limit) {
            return None;
        }
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

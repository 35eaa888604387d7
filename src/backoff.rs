//! Exponential backoff for reconnects and replay retries.

use std::time::Duration;

use tracing::{debug, warn};

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Ceiling for any single delay.
    pub max: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Total attempts allowed, including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Tracks retry attempts and hands out growing delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    current_delay: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            current_delay: config.initial,
        }
    }

    /// Number of retries handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resets the retry state after a success.
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(attempts = self.attempt, "recovered, reset backoff");
        }
        self.attempt = 0;
        self.current_delay = self.config.initial;
    }

    /// Returns the delay before the next attempt, or `None` once the attempt
    /// budget is spent.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn next_delay(&mut self) -> Option<Duration> {
        // The first attempt is not a retry, so a budget of N allows N - 1 delays.
        if let Some(max) = self.config.max_attempts {
            if self.attempt + 1 >= max {
                warn!(attempts = self.attempt + 1, max, "retry budget exhausted");
                return None;
            }
        }

        self.attempt += 1;
        let delay = self.current_delay.min(self.config.max);

        let next_ms = (self.current_delay.as_millis() as f64 * self.config.multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms.max(1)).min(self.config.max);

        Some(delay)
    }
}

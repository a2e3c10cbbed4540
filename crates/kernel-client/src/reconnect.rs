//! Retry policy for socket re-establishment.
//!
//! The connection's socket task consults this policy after every failed
//! connect or socket loss: delays double from `initial_delay` up to
//! `max_delay`, and after `max_attempts` consecutive failures the policy
//! reports exhaustion and the connection rests at `disconnected` until an
//! explicit `reconnect()`.

use std::time::Duration;

/// Tunable backoff parameters.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Attempt counter over a [`ReconnectConfig`].
#[derive(Debug)]
pub(crate) struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Reset the counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The delay to wait before the next attempt, or `None` when exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let exponent = self.attempts.min(16);
        let delay = self
            .config
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay);
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

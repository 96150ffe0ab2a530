//! Reconnect backoff for the bus subscriber.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in each direction (0.0 disables).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Stateless-per-attempt exponential backoff: the delay is derived from
/// the attempt counter, so `reset` is the only mutation besides counting.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, with jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32);
        self.attempt += 1;

        let raw = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent as i32);
        let capped = raw.min(self.config.max_delay_ms as f64);

        let jittered = if self.config.jitter_factor > 0.0 {
            let spread = capped * self.config.jitter_factor;
            capped + rand::rng().random_range(-spread..spread)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(1.0) as u64)
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

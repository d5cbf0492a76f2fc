//! Exponential backoff with jitter.
//!
//! Used by the worker pool when the queue is unreachable and to space out
//! redeliveries of messages that failed with a transient error.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
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

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), without keeping state.
    ///
    /// `attempt = 1` yields `initial_delay_ms`; each further attempt multiplies
    /// by `multiplier`, capped at `max_delay_ms`, then jitter is applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        Duration::from_millis(self.apply_jitter(capped))
    }

    fn apply_jitter(&self, delay_ms: f64) -> u64 {
        if self.jitter_factor <= 0.0 {
            return delay_ms.max(1.0) as u64;
        }
        let range = delay_ms * self.jitter_factor;
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..range)
        } else {
            0.0
        };
        (delay_ms + jitter).max(1.0) as u64
    }
}

/// Stateful backoff that advances on each failure and resets on success.
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

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

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

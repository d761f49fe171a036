//! Exponential backoff with jitter for resubscribing to the change feed

use rand::Rng;
use std::time::Duration;

use crate::config::RelayConfig;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failed subscriptions tolerated before giving up
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&RelayConfig> for RetryConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            ..Default::default()
        }
    }
}

/// Tracks consecutive failures and hands out the next delay.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_backoff;
        Self {
            config,
            attempt: 0,
            current,
        }
    }

    /// Returns `None` once `max_retries` consecutive failures have been recorded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        self.attempt += 1;

        let delay = apply_jitter(self.current, self.config.jitter);
        self.current = Duration::from_millis(
            (self.current.as_millis() as f64 * self.config.backoff_multiplier)
                .min(self.config.max_backoff.as_millis() as f64) as u64,
        );
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.config.initial_backoff;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}

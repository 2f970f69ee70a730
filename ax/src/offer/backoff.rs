//! Retry backoff for slot preparation

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(rename = "initial-ms", default = "default_initial_ms")]
    pub initial_ms: u64,

    /// Multiplier applied per consecutive failure
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Upper bound on any delay
    #[serde(rename = "max-ms", default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_initial_ms() -> u64 {
    1_500
}

fn default_factor() -> f64 {
    1.8
}

fn default_max_ms() -> u64 {
    20_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            factor: default_factor(),
            max_ms: default_max_ms(),
        }
    }
}

/// Consecutive-failure backoff: `initial`, then `floor(min(prev * factor, max))`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    last_ms: Option<u64>,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            last_ms: None,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.last_ms {
            None => self.config.initial_ms.min(self.config.max_ms),
            Some(last) => (last as f64 * self.config.factor).min(self.config.max_ms as f64).floor() as u64,
        };
        self.last_ms = Some(next);
        self.failures += 1;
        debug!(failures = self.failures, delay_ms = next, "Backoff::next_delay");
        Duration::from_millis(next)
    }

    /// Forget past failures (after a confirmed offer or an invalidation)
    pub fn reset(&mut self) {
        self.last_ms = None;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

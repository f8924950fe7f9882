//! Retry policy applied to every activity.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::trigger::duration_secs;

/// Bounded retry policy. Backoff is exponential, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    pub backoff_coefficient: f64,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10 * 60),
            initial_backoff: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_backoff: Duration::from_secs(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout,
            ..Self::default()
        }
    }

    /// Delay after failed attempt `attempt` (1-based) before the next one.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be >= 1");
        }
        if self.attempt_timeout.is_zero() {
            anyhow::bail!("retry.attempt_timeout must be > 0");
        }
        if !(self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0) {
            anyhow::bail!("retry.backoff_coefficient must be >= 1.0");
        }
        if self.max_backoff < self.initial_backoff {
            anyhow::bail!("retry.max_backoff must be >= retry.initial_backoff");
        }
        Ok(())
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Bounded exponential backoff.
///
/// Attempt `n` (0-based) waits `first_ms * factor^n`, capped at `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total tries including the first one.
    pub attempts: u32,
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl RetryPolicy {
    /// Single try, no waiting.
    pub fn never() -> Self {
        Self {
            attempts: 1,
            first_ms: 0,
            max_ms: 0,
            factor: 1.0,
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let raw = self.first_ms as f64 * self.factor.powi(retry as i32);
        let ms = if raw.is_finite() {
            raw.min(self.max_ms as f64)
        } else {
            self.max_ms as f64
        };
        Duration::from_millis(ms as u64)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.attempts == 0 {
            return Err(ModelError::InvalidRetryPolicy(
                "attempts must be at least 1".into(),
            ));
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err(ModelError::InvalidRetryPolicy(format!(
                "factor must be a finite number >= 1.0, got {}",
                self.factor
            )));
        }
        if self.first_ms > self.max_ms {
            return Err(ModelError::InvalidRetryPolicy(format!(
                "first_ms ({}) exceeds max_ms ({})",
                self.first_ms, self.max_ms
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            first_ms: 100,
            max_ms: 5_000,
            factor: 2.0,
        }
    }
}

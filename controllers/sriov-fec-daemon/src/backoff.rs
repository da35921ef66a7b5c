//! # Exponential Backoff
//!
//! Per-record retry delays after a failed reconciliation pass.
//! The delay starts at `min`, doubles after every consecutive failure and is
//! capped at `max`. A successful pass resets it.
//!
//! Sequence with the defaults (1s, 300s): 1s, 2s, 4s, 8s, ... 256s, 300s (max).

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Minimum delay (first retry, and value after reset)
    min: Duration,
    /// Delay returned by the next call to `next_backoff`
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `min` and capped at `max`
    ///
    /// A `max` below `min` is raised to `min`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = std::cmp::max(min, max);
        Self {
            min,
            current: min,
            max,
        }
    }

    /// Get the next backoff delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

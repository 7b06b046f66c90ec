//! Retry policy for retryable record failures.
//!
//! When processing a record fails with a retryable error (a state write that hit
//! an I/O error), the partition worker retries the same record after a backoff
//! instead of moving on, so records of a key are never reordered. Once the
//! attempts are exhausted the error is reported and the record stays
//! unacknowledged.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often and how patiently a worker retries a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before each retry, in milliseconds.
    pub backoff_ms: u64,
    /// Upper bound for the doubled backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the number of attempts.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Sets the initial backoff.
    pub fn with_backoff(mut self, d: Duration) -> Self {
        self.backoff_ms = d.as_millis() as u64;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed. Doubles per attempt up
    /// to `max_backoff_ms`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default().with_backoff(Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(30), Duration::from_millis(5_000));
    }

    #[test]
    fn none_allows_a_single_attempt() {
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }
}

//! Typed retry policy for subtask execution failures.
//!
//! Failures fall into three classes with distinct budgets: timeouts retry
//! immediately (up to 5 attempts total), content rejections fail
//! terminally, and everything else retries after a short backoff (up to 2
//! attempts total). The decision is made against the subtask's retry count
//! *before* the failing attempt is recorded; the store advances the count
//! by one on every classified failure, so a terminally failed subtask's
//! count equals the number of attempts it consumed.

use std::time::Duration;

use crate::client::ImageApiError;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the attempt immediately.
    RetryNow,
    /// Re-run the attempt after the given delay.
    RetryAfter(Duration),
    /// Mark the subtask failed; no further attempts.
    Fail,
}

/// Retry budgets, attempt counts inclusive of the initial attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts allowed on the timeout path.
    pub max_timeout_attempts: u32,
    /// Total attempts allowed on the generic-failure path.
    pub max_generic_attempts: u32,
    /// Delay before a generic retry.
    pub generic_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_timeout_attempts: 5,
            max_generic_attempts: 2,
            generic_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Classifies a failed attempt. `retry_count` is the subtask's count
    /// before this failure is recorded.
    pub fn classify(&self, error: &ImageApiError, retry_count: u32) -> RetryDecision {
        match error {
            ImageApiError::IllegalContent => RetryDecision::Fail,
            ImageApiError::Timeout => {
                if retry_count + 1 < self.max_timeout_attempts {
                    RetryDecision::RetryNow
                } else {
                    RetryDecision::Fail
                }
            }
            _ => {
                if retry_count + 1 < self.max_generic_attempts {
                    RetryDecision::RetryAfter(self.generic_backoff)
                } else {
                    RetryDecision::Fail
                }
            }
        }
    }
}

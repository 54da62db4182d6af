//! Retry policy for inbound messages and outbox delivery.

use std::time::Duration;

use crate::error::Error;

use super::pipeline::Acknowledgement;

/// Decides how long to wait before a failed message is tried again.
///
/// The first `immediate_attempts` failures are retried without delay. After
/// that the delay grows exponentially: `min(base_delay * 2^(n-1), max_delay)`
/// where `n` counts the delayed retries. Once `max_attempts` attempts have
/// failed the message is given up on.
///
/// With defaults (1 immediate, base=1s, max=300s, unbounded):
/// - Attempt 1 fails: retry immediately
/// - Attempt 2 fails: retry after 1s
/// - Attempt 3 fails: retry after 2s
/// - Attempt 4 fails: retry after 4s
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ironsaga::RetryPolicy;
///
/// let policy = RetryPolicy::default().with_max_attempts(5);
/// assert_eq!(policy.retry_delay(1), Duration::ZERO);
/// assert_eq!(policy.retry_delay(3), Duration::from_secs(2));
/// assert!(!policy.should_retry(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures retried without delay. Default: 1.
    pub immediate_attempts: u32,

    /// Base delay for exponential backoff. Default: 1 second.
    pub base_delay: Duration,

    /// Maximum delay between retries. Default: 5 minutes.
    pub max_delay: Duration,

    /// Attempts (including the first) before giving up. Default: unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            immediate_attempts: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_immediate_attempts(mut self, immediate_attempts: u32) -> Self {
        self.immediate_attempts = immediate_attempts;
        self
    }

    /// Exponential backoff for the `n`th delayed retry (1-based), capped at `max_delay`.
    pub fn backoff_duration(&self, n: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(n.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Delay after attempt `attempt` (1-based) failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt <= self.immediate_attempts {
            Duration::ZERO
        } else {
            self.backoff_duration(attempt - self.immediate_attempts)
        }
    }

    /// Returns `true` if another attempt should follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    /// The attempt limit for stores that need a concrete bound.
    pub(crate) fn attempt_limit(&self) -> u32 {
        self.max_attempts.unwrap_or(u32::MAX)
    }

    /// Map a failed attempt to the acknowledgement sent back to the transport.
    ///
    /// Errors that retrying cannot fix are rejected straight away.
    pub fn acknowledge(&self, attempt: u32, error: &Error) -> Acknowledgement {
        if error.is_permanent() {
            return Acknowledgement::Reject(error.to_string());
        }
        if !self.should_retry(attempt) {
            return Acknowledgement::Reject(format!("gave up after {attempt} attempts: {error}"));
        }
        Acknowledgement::Retry(self.retry_delay(attempt))
    }
}

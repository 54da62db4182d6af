//! Runtime configuration.

use std::time::Duration;

use super::retry::RetryPolicy;

/// Configuration for the saga runtime.
///
/// Controls inbound concurrency and timeouts, retry behavior, and the outbox
/// relay workers.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ironsaga::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     message_timeout: Duration::from_secs(10),
///     prefetch: 64,
///     outbox_workers: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Deadline for handling one inbound message, all sagas included.
    ///
    /// A message that exceeds it is rolled back and retried.
    /// Default: 30 seconds.
    pub message_timeout: Duration,

    /// Maximum inbound messages processed concurrently.
    ///
    /// Default: 16.
    pub prefetch: usize,

    /// Retry policy for inbound messages whose handling failed.
    pub inbound_retry: RetryPolicy,

    /// How often relays poll the outbox for due messages.
    ///
    /// Lower values reduce latency but increase store load.
    /// Default: 100ms.
    pub outbox_poll_interval: Duration,

    /// How long a relay holds a claimed outbox message.
    ///
    /// Should be longer than the slowest expected publish. If a relay
    /// crashes, the message becomes available after this duration.
    /// Default: 5 minutes.
    pub outbox_lock_duration: Duration,

    /// Retry policy for failed outbox deliveries.
    ///
    /// Messages are dead-lettered after `max_attempts`. Default: 5 attempts.
    pub outbox_retry: RetryPolicy,

    /// Number of outbox relays to spawn.
    ///
    /// Relays coordinate through the store's claim locking, so no message is
    /// published by two relays at once. Default: 1.
    pub outbox_workers: usize,

    /// Maximum time to wait for in-flight work during shutdown.
    ///
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Worker identifier used for outbox locks.
    ///
    /// If `None`, a UUID is generated when the runtime is built.
    pub worker_id: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            prefetch: 16,
            inbound_retry: RetryPolicy::default(),
            outbox_poll_interval: Duration::from_millis(100),
            outbox_lock_duration: Duration::from_secs(300), // 5 minutes
            outbox_retry: RetryPolicy::default()
                .with_immediate_attempts(0)
                .with_max_attempts(5),
            outbox_workers: 1,
            shutdown_timeout: Duration::from_secs(30),
            worker_id: None,
        }
    }
}

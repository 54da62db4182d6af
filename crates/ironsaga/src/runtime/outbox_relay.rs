//! Outbox relay for publishing messages produced by sagas.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::RuntimeConfig;
use crate::envelope::Envelope;
use crate::store::{OutboxMessage, OutboxRepository};

/// Publishes outbound messages to a broker.
///
/// Delivery is **at-least-once**: a message may be published again if the
/// relay fails between publishing and marking it delivered. Consumers should
/// deduplicate by [`Envelope::message_id`].
///
/// # Errors
///
/// Every error is treated as retryable. The relay retries with the outbox
/// [`RetryPolicy`](super::RetryPolicy) until `max_attempts`, then leaves the
/// message in the outbox as a dead letter.
///
/// # Example
///
/// ```ignore
/// struct BrokerTransport {
///     client: BrokerClient,
/// }
///
/// #[async_trait]
/// impl Transport for BrokerTransport {
///     type Error = BrokerError;
///
///     async fn publish(&self, envelope: &Envelope) -> Result<(), BrokerError> {
///         let topic = envelope.message().message_type();
///         self.client.send(topic, serde_json::to_vec(envelope)?).await
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Must implement `Display` for dead letter storage.
    type Error: Display + Send + 'static;

    async fn publish(&self, envelope: &Envelope) -> Result<(), Self::Error>;
}

/// Worker that delivers due outbox messages through a [`Transport`].
///
/// # Lifecycle
///
/// 1. Poll at `outbox_poll_interval`
/// 2. Claim a due message (atomic lock with timeout)
/// 3. Publish it
/// 4. Mark it delivered, or record the failure with backoff
/// 5. Repeat until shutdown signal
///
/// Claimed messages are drained back to back; the relay only waits for the
/// next tick once the outbox has nothing due.
pub struct OutboxRelay<S, T>
where
    S: OutboxRepository,
    T: Transport,
{
    store: S,
    transport: Arc<T>,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S, T> OutboxRelay<S, T>
where
    S: OutboxRepository,
    T: Transport,
{
    pub fn new(store: S, transport: Arc<T>, config: RuntimeConfig, worker_id: String) -> Self {
        Self {
            store,
            transport,
            config,
            worker_id,
        }
    }

    /// Run the relay until the shutdown receiver signals.
    ///
    /// A publish in progress is finished before the relay exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.outbox_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Outbox relay started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    loop {
                        match self.relay_one().await {
                            Ok(true) if !*shutdown.borrow() => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(
                                    worker_id = %self.worker_id,
                                    error = %e,
                                    "Error relaying outbox message"
                                );
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Outbox relay shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and publish one due message.
    ///
    /// Returns `Ok(false)` when nothing was due.
    pub async fn relay_one(&self) -> crate::Result<bool> {
        let retry = &self.config.outbox_retry;
        let claimed = self
            .store
            .claim_outbox_message(
                &self.worker_id,
                self.config.outbox_lock_duration,
                retry.attempt_limit(),
            )
            .await?;

        let Some(message) = claimed else {
            return Ok(false);
        };

        let message_id = message.envelope.message_id();
        debug!(
            %message_id,
            message_type = message.envelope.message().message_type(),
            attempt = message.attempts + 1,
            "Publishing outbox message"
        );

        match self.transport.publish(&message.envelope).await {
            Ok(()) => {
                self.store.mark_delivered(message_id).await?;
                debug!(%message_id, "Outbox message delivered");
            }
            Err(err) => self.record_failure(&message, &err.to_string()).await?,
        }

        Ok(true)
    }

    async fn record_failure(&self, message: &OutboxMessage, error: &str) -> crate::Result<()> {
        let retry = &self.config.outbox_retry;
        let message_id = message.envelope.message_id();
        let attempts = message.attempts + 1;

        if retry.should_retry(attempts) {
            debug!(%message_id, error, attempts, "Publish failed, will retry");
            self.store
                .record_delivery_failure(message_id, error, retry.retry_delay(attempts))
                .await
        } else {
            warn!(
                %message_id,
                error,
                attempts,
                "Outbox message exceeded max retries, moving to dead letter"
            );
            self.store
                .record_permanent_failure(message_id, error, retry.attempt_limit())
                .await
        }
    }
}

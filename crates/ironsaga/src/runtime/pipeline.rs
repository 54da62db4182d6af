//! Inbound message processing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::handler::{HandleOutcome, SagaMessageHandler};
use crate::mapper::InstanceMapper;
use crate::persistence::Persister;
use crate::saga::Saga;
use crate::store::{OutboxRepository, Store, Transaction};

/// Verdict returned to the transport for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processed; remove the message.
    Ack,
    /// Deliver the message again after the delay.
    Retry(Duration),
    /// Give up on the message.
    Reject(String),
}

/// One delivery of an inbound message from a transport.
#[derive(Debug)]
pub struct InboundDelivery {
    pub envelope: Envelope,
    /// 1-based delivery attempt, as counted by the transport.
    pub attempt: u32,
    /// Receives the acknowledgement once processing finished.
    pub responder: oneshot::Sender<Acknowledgement>,
}

impl InboundDelivery {
    /// Create a delivery and the receiver its acknowledgement arrives on.
    pub fn new(envelope: Envelope, attempt: u32) -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (responder, receiver) = oneshot::channel();
        let delivery = Self {
            envelope,
            attempt,
            responder,
        };
        (delivery, receiver)
    }
}

/// Type-erased saga handler for dynamic dispatch.
///
/// Lets the pipeline hold handlers for different saga, mapper and persister
/// types in one list.
#[async_trait]
pub(crate) trait HandlerEntry<S: Store>: Send + Sync {
    fn persistence_key(&self) -> &'static str;

    /// Returns `true` if the saga declares `message_type`.
    fn handles(&self, message_type: &str) -> bool;

    async fn handle_in_tx(&self, tx: &mut S::Tx, envelope: &Envelope) -> Result<HandleOutcome>;
}

#[async_trait]
impl<G, S, M, P> HandlerEntry<S> for SagaMessageHandler<G, S, M, P>
where
    G: Saga,
    S: Store + OutboxRepository,
    M: InstanceMapper<G, S>,
    P: Persister<G, S>,
{
    fn persistence_key(&self) -> &'static str {
        G::PERSISTENCE_KEY
    }

    fn handles(&self, message_type: &str) -> bool {
        self.message_types().contains(message_type)
    }

    async fn handle_in_tx(&self, tx: &mut S::Tx, envelope: &Envelope) -> Result<HandleOutcome> {
        SagaMessageHandler::handle_in_tx(self, tx, envelope).await
    }
}

/// Routes inbound messages to every saga that declares their type.
///
/// All sagas handling one message share a transaction, so the message's
/// effects commit together or not at all. Failures are mapped to
/// acknowledgements through the inbound [`RetryPolicy`].
pub struct InboundPipeline<S: Store> {
    store: S,
    handlers: Arc<[Box<dyn HandlerEntry<S>>]>,
    retry: RetryPolicy,
    message_timeout: Duration,
    prefetch: usize,
}

impl<S: Store> Clone for InboundPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            handlers: Arc::clone(&self.handlers),
            retry: self.retry.clone(),
            message_timeout: self.message_timeout,
            prefetch: self.prefetch,
        }
    }
}

impl<S: Store> InboundPipeline<S> {
    pub(crate) fn new(
        store: S,
        handlers: Vec<Box<dyn HandlerEntry<S>>>,
        retry: RetryPolicy,
        message_timeout: Duration,
        prefetch: usize,
    ) -> Self {
        Self {
            store,
            handlers: handlers.into(),
            retry,
            message_timeout,
            prefetch: prefetch.max(1),
        }
    }

    /// Number of registered sagas.
    pub fn saga_count(&self) -> usize {
        self.handlers.len()
    }

    /// Handle `envelope` with every saga that declares its type.
    ///
    /// Returns each saga's outcome, keyed by persistence key. A message no
    /// saga declares yields an empty list.
    pub async fn process(&self, envelope: &Envelope) -> Result<Vec<(&'static str, HandleOutcome)>> {
        let work = async {
            let message_type = envelope.message().message_type();
            let mut tx = self.store.begin().await?;
            let mut outcomes = Vec::new();

            for handler in self.handlers.iter().filter(|h| h.handles(message_type)) {
                match handler.handle_in_tx(&mut tx, envelope).await {
                    Ok(outcome) => outcomes.push((handler.persistence_key(), outcome)),
                    Err(err) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(
                                message_id = %envelope.message_id(),
                                error = %rollback_err,
                                "Rollback failed"
                            );
                        }
                        return Err(err);
                    }
                }
            }

            tx.commit().await?;
            Ok::<_, Error>(outcomes)
        };

        tokio::time::timeout(self.message_timeout, work)
            .await
            .map_err(|_| Error::Timeout(self.message_timeout))?
    }

    /// Process one delivery and send its acknowledgement.
    pub async fn deliver(&self, delivery: InboundDelivery) {
        let InboundDelivery {
            envelope,
            attempt,
            responder,
        } = delivery;

        let ack = match self.process(&envelope).await {
            Ok(outcomes) => {
                debug!(
                    message_id = %envelope.message_id(),
                    message_type = envelope.message().message_type(),
                    sagas = outcomes.len(),
                    "Inbound message processed"
                );
                Acknowledgement::Ack
            }
            Err(err) => {
                let ack = self.retry.acknowledge(attempt, &err);
                warn!(
                    message_id = %envelope.message_id(),
                    message_type = envelope.message().message_type(),
                    attempt,
                    error = %err,
                    ?ack,
                    "Inbound message failed"
                );
                ack
            }
        };

        if responder.send(ack).is_err() {
            debug!(message_id = %envelope.message_id(), "Acknowledgement receiver dropped");
        }
    }

    /// Consume deliveries until the channel closes or `cancel` fires.
    ///
    /// At most `prefetch` deliveries are processed concurrently. In-flight
    /// deliveries are finished before returning.
    pub async fn run(
        &self,
        mut deliveries: mpsc::Receiver<InboundDelivery>,
        cancel: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(self.prefetch));
        let mut in_flight = JoinSet::new();

        info!(prefetch = self.prefetch, sagas = self.saga_count(), "Inbound pipeline started");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let pipeline = self.clone();
            in_flight.spawn(async move {
                pipeline.deliver(delivery).await;
                drop(permit);
            });

            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        info!("Inbound pipeline stopped");
    }
}

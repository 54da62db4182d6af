//! Orchestration of one inbound message for one saga.
//!
//! [`SagaMessageHandler`] ties a saga's mapper and persister together:
//!
//! ```text
//! envelope ──► decode ──► map ──┬─ unrouted ─────────────────────────► Unmapped
//!                               ▼
//!                        begin unit of work
//!                               │
//!               new + non-trigger ─► handle_not_found ──────────────► NotFound
//!                               │
//!                        handle_message ──► apply reaction
//!                               │
//!                  complete? ───┼─ yes ─► save_and_complete ─► drop mapping ─► Completed
//!                               └─ no ──► save ─► update mapping ─────────► Saved / Unchanged
//!                               │
//!                     captured messages ─► outbox
//! ```
//!
//! Everything happens in one transaction. Any error aborts it and is
//! returned unchanged; retrying is left to the caller.

use std::marker::PhantomData;

use nonempty::NonEmpty;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::mapper::InstanceMapper;
use crate::persistence::{Outbound, Persister, SaveOutcome, UnitOfWork};
use crate::saga::{InstanceId, MessageTypes, Saga};
use crate::store::{OutboxRepository, Store, Transaction};

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The message is not routed to this saga. Nothing was done.
    Unmapped,
    /// A non-trigger message addressed an instance that does not exist.
    NotFound { instance_id: InstanceId },
    /// The instance already completed; the message was ignored.
    AlreadyComplete { instance_id: InstanceId },
    /// The message was handled without changing the instance.
    Unchanged {
        instance_id: InstanceId,
        revision: u64,
    },
    /// The instance was saved at `revision`.
    Saved {
        instance_id: InstanceId,
        revision: u64,
    },
    /// The instance completed and was retired at `revision`.
    Completed {
        instance_id: InstanceId,
        revision: u64,
    },
}

impl HandleOutcome {
    /// The instance the message was routed to, if any.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            HandleOutcome::Unmapped => None,
            HandleOutcome::NotFound { instance_id }
            | HandleOutcome::AlreadyComplete { instance_id }
            | HandleOutcome::Unchanged { instance_id, .. }
            | HandleOutcome::Saved { instance_id, .. }
            | HandleOutcome::Completed { instance_id, .. } => Some(instance_id),
        }
    }
}

/// Handles inbound messages for saga `G`.
///
/// # Example
///
/// ```ignore
/// let handler = SagaMessageHandler::<ShippingSaga, _, _, _>::new(
///     store.clone(),
///     KeySetMapper::new(),
///     CrudPersister::new(),
/// );
/// match handler.handle(&envelope).await? {
///     HandleOutcome::Saved { revision, .. } => println!("now at {revision}"),
///     other => println!("{other:?}"),
/// }
/// ```
pub struct SagaMessageHandler<G, S, M, P> {
    store: S,
    mapper: M,
    persister: P,
    message_types: MessageTypes,
    _saga: PhantomData<fn() -> G>,
}

impl<G, S, M, P> SagaMessageHandler<G, S, M, P>
where
    G: Saga,
    S: Store + OutboxRepository,
    M: InstanceMapper<G, S>,
    P: Persister<G, S>,
{
    pub fn new(store: S, mapper: M, persister: P) -> Self {
        Self {
            store,
            mapper,
            persister,
            message_types: G::message_types(),
            _saga: PhantomData,
        }
    }

    /// Message types routed to this saga.
    pub fn message_types(&self) -> &MessageTypes {
        &self.message_types
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Handle `envelope` in a transaction of its own.
    pub async fn handle(&self, envelope: &Envelope) -> Result<HandleOutcome> {
        let mut tx = self.store.begin().await?;
        match self.handle_in_tx(&mut tx, envelope).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        message_id = %envelope.message_id(),
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Handle `envelope` inside the caller's transaction.
    ///
    /// The caller commits or rolls back.
    pub async fn handle_in_tx(&self, tx: &mut S::Tx, envelope: &Envelope) -> Result<HandleOutcome> {
        let message_type = envelope.message().message_type();
        if !self.message_types.contains(message_type) {
            return Ok(HandleOutcome::Unmapped);
        }

        let message: G::Message = envelope.message().decode()?;

        let Some(instance_id) = self
            .mapper
            .map_message_to_instance(&self.store, tx, envelope, &message)
            .await?
        else {
            debug!(
                persistence_key = G::PERSISTENCE_KEY,
                message_id = %envelope.message_id(),
                message_type,
                "Message not mapped to an instance, ignored"
            );
            return Ok(HandleOutcome::Unmapped);
        };

        let mut uow = self
            .persister
            .begin_unit_of_work(&self.store, tx, Outbound::new(), instance_id.clone())
            .await?;

        if uow.instance().is_new() {
            if !self.message_types.is_trigger(message_type) {
                G::handle_not_found(envelope, &message)?;
                return Ok(HandleOutcome::NotFound { instance_id });
            }
        } else if G::is_instance_complete(uow.instance().data()) {
            debug!(
                persistence_key = G::PERSISTENCE_KEY,
                instance_id = %instance_id,
                message_id = %envelope.message_id(),
                "Instance already complete, message ignored"
            );
            return Ok(HandleOutcome::AlreadyComplete { instance_id });
        }

        let reaction = G::handle_message(uow.instance().data(), message)?;
        self.persister.apply_reaction(&mut uow, envelope, reaction)?;

        let outcome = if G::is_instance_complete(uow.instance().data()) {
            let revision = self
                .persister
                .save_and_complete(&self.store, tx, &mut uow)
                .await?;
            if revision != 0 {
                self.mapper
                    .delete_mapping(&self.store, tx, uow.instance())
                    .await?;
            }
            HandleOutcome::Completed {
                instance_id,
                revision,
            }
        } else {
            match self.persister.save(&self.store, tx, &mut uow).await? {
                SaveOutcome::Changed { revision } => {
                    self.mapper
                        .update_mapping(&self.store, tx, uow.instance())
                        .await?;
                    HandleOutcome::Saved {
                        instance_id,
                        revision,
                    }
                }
                SaveOutcome::NoChanges => HandleOutcome::Unchanged {
                    revision: uow.instance().revision(),
                    instance_id,
                },
            }
        };

        if let Some(envelopes) = NonEmpty::from_vec(uow.into_outbound().into_envelopes()) {
            debug!(
                persistence_key = G::PERSISTENCE_KEY,
                message_id = %envelope.message_id(),
                count = envelopes.len(),
                "Enqueuing outbound messages"
            );
            self.store
                .enqueue_outbox(tx, envelope.message_id(), envelopes)
                .await?;
        }

        debug!(
            persistence_key = G::PERSISTENCE_KEY,
            message_id = %envelope.message_id(),
            ?outcome,
            "Message handled"
        );
        Ok(outcome)
    }
}

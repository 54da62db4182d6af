use tracing::debug;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::saga::{InstanceId, Reaction, Saga, SagaInstance};
use crate::store::InstanceRepository;

use super::sender::{MessageSender, Outbound, child_envelope};
use super::{Persister, SaveOutcome, UnitOfWork};

/// Stores the full instance data under a revision check.
///
/// Every committed change increments the revision by one. A save whose data
/// equals what was loaded writes nothing. Completion deletes the record.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrudPersister;

impl CrudPersister {
    pub fn new() -> Self {
        Self
    }
}

/// Unit of work for [`CrudPersister`].
pub struct CrudUnitOfWork<D> {
    instance: SagaInstance<D>,
    /// Data as last loaded or saved.
    baseline: D,
    sender: Outbound,
}

impl<D: Send> UnitOfWork<D> for CrudUnitOfWork<D> {
    fn instance(&self) -> &SagaInstance<D> {
        &self.instance
    }

    fn outbound(&self) -> &Outbound {
        &self.sender
    }

    fn into_outbound(self) -> Outbound {
        self.sender
    }
}

impl<G, S> Persister<G, S> for CrudPersister
where
    G: Saga,
    S: InstanceRepository,
{
    type UnitOfWork = CrudUnitOfWork<G::Data>;

    async fn begin_unit_of_work(
        &self,
        store: &S,
        tx: &mut S::Tx,
        sender: Outbound,
        instance_id: InstanceId,
    ) -> Result<CrudUnitOfWork<G::Data>> {
        let (revision, data) = match store
            .load_instance(tx, G::PERSISTENCE_KEY, &instance_id)
            .await?
        {
            Some(stored) => (stored.revision, serde_json::from_value(stored.data)?),
            None => (0, G::new_data(&instance_id)),
        };

        Ok(CrudUnitOfWork {
            baseline: G::Data::clone(&data),
            instance: SagaInstance::new(instance_id, revision, data),
            sender,
        })
    }

    fn apply_reaction(
        &self,
        uow: &mut CrudUnitOfWork<G::Data>,
        inbound: &Envelope,
        reaction: Reaction<G::Data>,
    ) -> Result<()> {
        let (update, outgoing) = reaction.into_parts();
        if let Some(data) = update {
            *uow.instance.data_mut() = data;
        }
        for message in outgoing {
            uow.sender.send(child_envelope(inbound, message))?;
        }
        Ok(())
    }

    async fn save(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut CrudUnitOfWork<G::Data>,
    ) -> Result<SaveOutcome> {
        if *uow.instance.data() == uow.baseline {
            return Ok(SaveOutcome::NoChanges);
        }

        let revision = uow.instance.revision();
        let data = serde_json::to_value(uow.instance.data())?;
        store
            .save_instance(tx, G::PERSISTENCE_KEY, uow.instance.id(), revision, &data)
            .await?;

        uow.instance.set_revision(revision + 1);
        uow.baseline = uow.instance.data().clone();
        debug!(
            persistence_key = G::PERSISTENCE_KEY,
            instance_id = %uow.instance.id(),
            revision = revision + 1,
            "Instance saved"
        );
        Ok(SaveOutcome::Changed {
            revision: revision + 1,
        })
    }

    async fn save_and_complete(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut CrudUnitOfWork<G::Data>,
    ) -> Result<u64> {
        let revision = uow.instance.revision();
        if revision == 0 {
            // Never persisted; there is no record to delete.
            return Ok(0);
        }

        store
            .delete_instance(tx, G::PERSISTENCE_KEY, uow.instance.id(), revision)
            .await?;
        uow.instance.set_revision(revision + 1);
        debug!(
            persistence_key = G::PERSISTENCE_KEY,
            instance_id = %uow.instance.id(),
            revision = revision + 1,
            "Instance completed and deleted"
        );
        Ok(revision + 1)
    }
}

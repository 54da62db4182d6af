use tracing::debug;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::saga::{InstanceId, KeySetSaga, SagaInstance};
use crate::store::KeySetRepository;

use super::InstanceMapper;

/// Maps messages through key sets owned by instances.
///
/// A message is routed by [`KeySetSaga::mapping_key`]. If no instance owns
/// the key, a fresh ID is generated with [`KeySetSaga::generate_instance_id`];
/// the handler then creates the instance for a trigger message or reports it
/// as not found otherwise. Messages without a mapping key are not routed.
///
/// After every save the instance's stored key set is replaced by
/// [`KeySetSaga::instance_keys`]. Claiming a key another instance owns fails
/// with [`Error::KeyCollision`](crate::Error::KeyCollision).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySetMapper;

impl KeySetMapper {
    pub fn new() -> Self {
        Self
    }
}

impl<G, S> InstanceMapper<G, S> for KeySetMapper
where
    G: KeySetSaga,
    S: KeySetRepository,
{
    async fn map_message_to_instance(
        &self,
        store: &S,
        tx: &mut S::Tx,
        envelope: &Envelope,
        message: &G::Message,
    ) -> Result<Option<InstanceId>> {
        let Some(key) = G::mapping_key(message) else {
            return Ok(None);
        };

        if let Some(owner) = store
            .find_instance_by_key(tx, G::PERSISTENCE_KEY, &key)
            .await?
        {
            return Ok(Some(owner));
        }

        let instance_id = G::generate_instance_id(envelope, message);
        debug!(
            persistence_key = G::PERSISTENCE_KEY,
            mapping_key = %key,
            instance_id = %instance_id,
            "No instance owns mapping key"
        );
        Ok(Some(instance_id))
    }

    async fn update_mapping(
        &self,
        store: &S,
        tx: &mut S::Tx,
        instance: &SagaInstance<G::Data>,
    ) -> Result<()> {
        let keys = G::instance_keys(instance.data());
        store
            .replace_keys(tx, G::PERSISTENCE_KEY, instance.id(), &keys)
            .await
    }

    async fn delete_mapping(
        &self,
        store: &S,
        tx: &mut S::Tx,
        instance: &SagaInstance<G::Data>,
    ) -> Result<()> {
        store
            .delete_keys(tx, G::PERSISTENCE_KEY, instance.id())
            .await
    }
}

use crate::envelope::Envelope;
use crate::error::Result;
use crate::saga::{HasInstanceId, InstanceId, Saga, SagaInstance};
use crate::store::Store;

use super::InstanceMapper;

/// Maps each message to the instance ID it carries.
///
/// Stateless: nothing is stored, so updating and deleting mappings are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMapper;

impl DirectMapper {
    pub fn new() -> Self {
        Self
    }
}

impl<G, S> InstanceMapper<G, S> for DirectMapper
where
    G: Saga,
    G::Message: HasInstanceId,
    S: Store,
{
    async fn map_message_to_instance(
        &self,
        _store: &S,
        _tx: &mut S::Tx,
        _envelope: &Envelope,
        message: &G::Message,
    ) -> Result<Option<InstanceId>> {
        Ok(Some(message.instance_id()))
    }

    async fn update_mapping(
        &self,
        _store: &S,
        _tx: &mut S::Tx,
        _instance: &SagaInstance<G::Data>,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_mapping(
        &self,
        _store: &S,
        _tx: &mut S::Tx,
        _instance: &SagaInstance<G::Data>,
    ) -> Result<()> {
        Ok(())
    }
}

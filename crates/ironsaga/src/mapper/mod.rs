//! Routing of inbound messages to saga instances.
//!
//! - [`DirectMapper`]: the instance ID is a field of every message
//! - [`KeySetMapper`]: instances own disjoint key sets kept in the store

mod direct;
mod keyset;

use std::future::Future;

pub use direct::DirectMapper;
pub use keyset::KeySetMapper;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::saga::{InstanceId, Saga, SagaInstance};
use crate::store::Store;

/// Resolves messages to instance identities and maintains the routing state.
///
/// Mappers hold no store handle; the store and the caller's transaction are
/// passed to every call so mapping changes commit with the instance change.
pub trait InstanceMapper<G: Saga, S: Store>: Send + Sync + 'static {
    /// Resolve the instance a message addresses.
    ///
    /// `Ok(None)` means the message is not routed to this saga. The returned
    /// instance may not exist yet; the handler decides whether the message
    /// may create it.
    fn map_message_to_instance(
        &self,
        store: &S,
        tx: &mut S::Tx,
        envelope: &Envelope,
        message: &G::Message,
    ) -> impl Future<Output = Result<Option<InstanceId>>> + Send;

    /// Record routing state for an instance that was saved.
    fn update_mapping(
        &self,
        store: &S,
        tx: &mut S::Tx,
        instance: &SagaInstance<G::Data>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove routing state for an instance that completed.
    fn delete_mapping(
        &self,
        store: &S,
        tx: &mut S::Tx,
        instance: &SagaInstance<G::Data>,
    ) -> impl Future<Output = Result<()>> + Send;
}

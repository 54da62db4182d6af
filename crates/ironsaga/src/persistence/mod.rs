//! Instance persistence strategies.
//!
//! A [`Persister`] loads an instance into a unit of work, applies the
//! [`Reaction`] produced by saga logic, and writes the result back under
//! optimistic concurrency. Two strategies are provided and share no code:
//!
//! - [`CrudPersister`]: stores the full instance data, guarded by revision
//! - [`EventSourcedPersister`]: appends the events the saga publishes to the
//!   instance stream, with periodic snapshots
//!
//! The strategy is chosen per saga when it is registered.

mod crud;
mod eventsourced;
mod sender;

use std::future::Future;

pub use crud::{CrudPersister, CrudUnitOfWork};
pub use eventsourced::{DEFAULT_SNAPSHOT_THRESHOLD, EventSourcedPersister, EventSourcedUnitOfWork};
pub use sender::{EventApplyingSender, MessageSender, Outbound, RecordingSender};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::saga::{InstanceId, Reaction, Saga, SagaInstance};
use crate::store::Store;

/// Result of [`Persister::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The instance was written and now has `revision`.
    Changed { revision: u64 },
    /// Nothing changed; nothing was written.
    NoChanges,
}

/// One load-handle-save cycle for a single instance.
///
/// Dropping a unit of work without saving discards it.
pub trait UnitOfWork<D>: Send {
    /// The instance as loaded and modified so far.
    fn instance(&self) -> &SagaInstance<D>;

    /// Messages captured during handling.
    fn outbound(&self) -> &Outbound;

    /// Consume the unit of work, returning captured messages.
    fn into_outbound(self) -> Outbound;
}

/// Loads and stores saga instances.
pub trait Persister<G: Saga, S: Store>: Send + Sync + 'static {
    type UnitOfWork: UnitOfWork<G::Data>;

    /// Load `instance_id`, or start a new instance at revision 0 if it does
    /// not exist. Messages produced during handling are captured in `sender`.
    fn begin_unit_of_work(
        &self,
        store: &S,
        tx: &mut S::Tx,
        sender: Outbound,
        instance_id: InstanceId,
    ) -> impl Future<Output = Result<Self::UnitOfWork>> + Send;

    /// Apply the result of saga logic to the unit of work.
    ///
    /// Outgoing messages are wrapped as children of `inbound`.
    fn apply_reaction(
        &self,
        uow: &mut Self::UnitOfWork,
        inbound: &Envelope,
        reaction: Reaction<G::Data>,
    ) -> Result<()>;

    /// Persist changes made in the unit of work.
    fn save(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut Self::UnitOfWork,
    ) -> impl Future<Output = Result<SaveOutcome>> + Send;

    /// Persist final changes and retire the instance. Returns the final revision.
    fn save_and_complete(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut Self::UnitOfWork,
    ) -> impl Future<Output = Result<u64>> + Send;
}

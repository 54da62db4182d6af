use nonempty::NonEmpty;
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::saga::{EventSourcedSaga, InstanceId, Reaction, SagaInstance};
use crate::store::{MessageStore, Snapshot, SnapshotRepository, instance_stream};

use super::sender::{EventApplyingSender, MessageSender, Outbound, RecordingSender, child_envelope};
use super::{Persister, SaveOutcome, UnitOfWork};

/// Number of events after which a new snapshot is written.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 100;

/// Persists instances as the events they publish.
///
/// Each instance owns the stream `"{persistence_key}:{instance_id}"`. Loading
/// replays the stream (from the latest snapshot, when one exists) through
/// [`EventSourcedSaga::apply_event`]; the revision is the number of events
/// replayed. Saving appends newly published events at the current revision,
/// so the stream's offset check rejects concurrent writers.
///
/// Completing an instance deletes its snapshots. The event stream is kept.
#[derive(Debug, Clone, Copy)]
pub struct EventSourcedPersister {
    snapshot_threshold: Option<u64>,
}

impl Default for EventSourcedPersister {
    fn default() -> Self {
        Self {
            snapshot_threshold: Some(DEFAULT_SNAPSHOT_THRESHOLD),
        }
    }
}

impl EventSourcedPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a snapshot once more than `threshold` events were appended since the last one.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = Some(threshold.max(1));
        self
    }

    /// Always replay from the start of the stream.
    pub fn without_snapshots(mut self) -> Self {
        self.snapshot_threshold = None;
        self
    }
}

/// Unit of work for [`EventSourcedPersister`].
pub struct EventSourcedUnitOfWork<D> {
    instance: SagaInstance<D>,
    sender: RecordingSender<Outbound>,
    /// Revision of the latest known snapshot.
    snapshot_revision: u64,
}

impl<D> EventSourcedUnitOfWork<D> {
    /// Events published but not yet appended.
    pub fn pending_events(&self) -> &[Envelope] {
        self.sender.recorded()
    }
}

impl<D: Send> UnitOfWork<D> for EventSourcedUnitOfWork<D> {
    fn instance(&self) -> &SagaInstance<D> {
        &self.instance
    }

    fn outbound(&self) -> &Outbound {
        self.sender.inner()
    }

    fn into_outbound(self) -> Outbound {
        self.sender.into_inner()
    }
}

impl EventSourcedPersister {
    async fn append_pending<G, S>(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut EventSourcedUnitOfWork<G::Data>,
    ) -> Result<Option<u64>>
    where
        G: EventSourcedSaga,
        S: MessageStore,
    {
        let Some(events) = NonEmpty::from_vec(uow.sender.take_recorded()) else {
            return Ok(None);
        };

        let count = events.len() as u64;
        let revision = uow.instance.revision();
        let stream = instance_stream(G::PERSISTENCE_KEY, uow.instance.id());
        store.append_messages(tx, &stream, revision, events).await?;

        uow.instance.set_revision(revision + count);
        trace!(%stream, from = revision, count, "Appended instance events");
        Ok(Some(revision + count))
    }
}

impl<G, S> Persister<G, S> for EventSourcedPersister
where
    G: EventSourcedSaga,
    S: MessageStore + SnapshotRepository,
{
    type UnitOfWork = EventSourcedUnitOfWork<G::Data>;

    async fn begin_unit_of_work(
        &self,
        store: &S,
        tx: &mut S::Tx,
        sender: Outbound,
        instance_id: InstanceId,
    ) -> Result<EventSourcedUnitOfWork<G::Data>> {
        let snapshot = match self.snapshot_threshold {
            Some(_) => {
                store
                    .load_snapshot(tx, G::PERSISTENCE_KEY, &instance_id)
                    .await?
            }
            None => None,
        };

        let (mut revision, mut data) = match snapshot {
            Some(snapshot) => (snapshot.revision, serde_json::from_value(snapshot.data)?),
            None => (0, G::new_data(&instance_id)),
        };
        let snapshot_revision = revision;

        // Replay through the transaction so events it already appended count.
        let stream = instance_stream(G::PERSISTENCE_KEY, &instance_id);
        let page_size = store.stream_config().page_size();
        loop {
            let records = store
                .fetch_stream_page_in_tx(tx, &stream, revision, page_size)
                .await?;
            let fetched = records.len();

            for record in records {
                if record.stream_offset != revision {
                    return Err(Error::DataIntegrity {
                        stream,
                        offset: record.stream_offset,
                        reason: format!("expected offset {revision}"),
                    });
                }
                let message = record.envelope.message();
                if !message.is_event() {
                    return Err(Error::DataIntegrity {
                        stream,
                        offset: record.stream_offset,
                        reason: format!("{} is not an event", message.message_type()),
                    });
                }
                let event: G::Event = message.decode()?;
                G::apply_event(&mut data, event);
                revision += 1;
            }

            if fetched < page_size as usize {
                break;
            }
        }

        debug!(
            persistence_key = G::PERSISTENCE_KEY,
            instance_id = %instance_id,
            revision,
            replayed = revision - snapshot_revision,
            "Instance loaded"
        );

        Ok(EventSourcedUnitOfWork {
            instance: SagaInstance::new(instance_id, revision, data),
            sender: RecordingSender::new(sender),
            snapshot_revision,
        })
    }

    fn apply_reaction(
        &self,
        uow: &mut EventSourcedUnitOfWork<G::Data>,
        inbound: &Envelope,
        reaction: Reaction<G::Data>,
    ) -> Result<()> {
        let (update, outgoing) = reaction.into_parts();
        if update.is_some() {
            return Err(Error::DirectStateMutation {
                persistence_key: G::PERSISTENCE_KEY.to_string(),
            });
        }

        let mut sender =
            EventApplyingSender::<G, _>::new(uow.instance.data_mut(), &mut uow.sender);
        for message in outgoing {
            sender.send(child_envelope(inbound, message))?;
        }
        Ok(())
    }

    async fn save(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut EventSourcedUnitOfWork<G::Data>,
    ) -> Result<SaveOutcome> {
        let Some(revision) = self.append_pending::<G, S>(store, tx, uow).await? else {
            return Ok(SaveOutcome::NoChanges);
        };

        if let Some(threshold) = self.snapshot_threshold {
            if revision - uow.snapshot_revision > threshold {
                let snapshot = Snapshot {
                    revision,
                    data: serde_json::to_value(uow.instance.data())?,
                };
                store
                    .save_snapshot(tx, G::PERSISTENCE_KEY, uow.instance.id(), snapshot)
                    .await?;
                uow.snapshot_revision = revision;
                debug!(
                    persistence_key = G::PERSISTENCE_KEY,
                    instance_id = %uow.instance.id(),
                    revision,
                    "Snapshot written"
                );
            }
        }

        Ok(SaveOutcome::Changed { revision })
    }

    async fn save_and_complete(
        &self,
        store: &S,
        tx: &mut S::Tx,
        uow: &mut EventSourcedUnitOfWork<G::Data>,
    ) -> Result<u64> {
        self.append_pending::<G, S>(store, tx, uow).await?;
        store
            .delete_snapshots(tx, G::PERSISTENCE_KEY, uow.instance.id())
            .await?;
        Ok(uow.instance.revision())
    }
}

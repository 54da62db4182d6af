//! In-process store implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nonempty::NonEmpty;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use super::outbox::{DeadLetter, DeadLetterQuery, OutboxMessage};
use super::{
    InstanceRepository, KeySetRepository, MessageStore, OutboxRepository, ProjectionStore,
    Snapshot, SnapshotRepository, Store, StoredInstance, StreamRecord, Transaction,
};
use crate::envelope::{Envelope, MessageId};
use crate::error::{Error, Result};
use crate::saga::InstanceId;
use crate::stream::StreamConfig;

/// In-process store for tests and single-process embedding.
///
/// Transactions are optimistic. [`Store::begin`] takes a snapshot of the
/// committed state; reads see that snapshot plus the transaction's own
/// writes. Every write is checked when it is made and staged. On commit the
/// staged writes are re-applied, in order, to the latest committed state
/// under a single lock; if any check fails there (another transaction
/// committed a conflicting write first) nothing is applied and the conflict
/// is returned. Global offsets are assigned during that commit, so global
/// order always equals commit order.
///
/// Snapshots copy every map of the store, so this backend suits test-sized
/// data sets. Message records are shared, not copied.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryState>>,
    config: StreamConfig,
}

impl MemoryStore {
    /// Create an empty store with default reader settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store whose readers use `config`.
    pub fn with_stream_config(config: StreamConfig) -> Self {
        Self {
            shared: Arc::default(),
            config,
        }
    }

    /// Undelivered outbox messages in enqueue order, including dead letters.
    pub async fn pending_outbox(&self) -> Vec<Envelope> {
        let state = self.shared.lock().await;
        state
            .outbox
            .values()
            .map(|entry| entry.envelope.clone())
            .collect()
    }
}

/// Transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    writes: Vec<Write>,
}

impl MemoryTransaction {
    /// Check a write against this transaction's view and stage it.
    fn stage(&mut self, write: Write) -> Result<()> {
        self.working.apply(&write, OffsetDateTime::now_utc())?;
        self.writes.push(write);
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    async fn commit(self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let mut shared = self.shared.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut next = shared.clone();
        for write in &self.writes {
            next.apply(write, now)?;
        }
        *shared = next;

        debug!(writes = self.writes.len(), "Memory transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Write {
    Append {
        stream: String,
        expected_offset: u64,
        envelopes: Vec<Envelope>,
    },
    SaveInstance {
        key: InstanceKey,
        expected_revision: u64,
        data: Value,
    },
    DeleteInstance {
        key: InstanceKey,
        expected_revision: u64,
    },
    ReplaceKeys {
        key: InstanceKey,
        keys: BTreeSet<String>,
    },
    DeleteKeys {
        key: InstanceKey,
    },
    SaveSnapshot {
        key: InstanceKey,
        snapshot: Snapshot,
    },
    DeleteSnapshots {
        key: InstanceKey,
    },
    EnqueueOutbox {
        causation_id: MessageId,
        envelopes: Vec<Envelope>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    persistence_key: String,
    instance_id: InstanceId,
}

impl InstanceKey {
    fn new(persistence_key: &str, instance_id: &InstanceId) -> Self {
        Self {
            persistence_key: persistence_key.to_owned(),
            instance_id: instance_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    envelope: Envelope,
    causation_id: MessageId,
    attempts: u32,
    last_error: Option<String>,
    locked_until: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    global: Vec<Arc<StreamRecord>>,
    streams: HashMap<String, Vec<Arc<StreamRecord>>>,
    instances: HashMap<InstanceKey, StoredInstance>,
    /// (persistence key, mapping key) -> owner
    key_owners: HashMap<(String, String), InstanceId>,
    owned_keys: HashMap<InstanceKey, BTreeSet<String>>,
    snapshots: HashMap<InstanceKey, Vec<Snapshot>>,
    outbox: BTreeMap<MessageId, OutboxEntry>,
    projections: HashMap<String, u64>,
}

impl MemoryState {
    fn stream_length(&self, stream: &str) -> u64 {
        self.streams.get(stream).map_or(0, |records| records.len() as u64)
    }

    fn apply(&mut self, write: &Write, now: OffsetDateTime) -> Result<()> {
        match write {
            Write::Append {
                stream,
                expected_offset,
                envelopes,
            } => {
                let actual = self.stream_length(stream);
                if actual != *expected_offset {
                    return Err(Error::OffsetConflict {
                        stream: stream.clone(),
                        expected: *expected_offset,
                        actual,
                    });
                }
                let records = self.streams.entry(stream.clone()).or_default();
                for (i, envelope) in envelopes.iter().enumerate() {
                    let record = Arc::new(StreamRecord {
                        stream: stream.clone(),
                        stream_offset: expected_offset + i as u64,
                        global_offset: self.global.len() as u64,
                        envelope: envelope.clone(),
                    });
                    records.push(Arc::clone(&record));
                    self.global.push(record);
                }
            }
            Write::SaveInstance {
                key,
                expected_revision,
                data,
            } => {
                let actual = self.instances.get(key).map(|stored| stored.revision);
                let matches = match actual {
                    None => *expected_revision == 0,
                    Some(revision) => *expected_revision != 0 && revision == *expected_revision,
                };
                if !matches {
                    return Err(revision_conflict(key, *expected_revision, actual));
                }
                self.instances.insert(
                    key.clone(),
                    StoredInstance {
                        revision: expected_revision + 1,
                        data: data.clone(),
                    },
                );
            }
            Write::DeleteInstance {
                key,
                expected_revision,
            } => {
                let actual = self.instances.get(key).map(|stored| stored.revision);
                if actual != Some(*expected_revision) {
                    return Err(revision_conflict(key, *expected_revision, actual));
                }
                self.instances.remove(key);
            }
            Write::ReplaceKeys { key, keys } => {
                for mapping_key in keys {
                    let slot = (key.persistence_key.clone(), mapping_key.clone());
                    match self.key_owners.get(&slot) {
                        Some(owner) if *owner != key.instance_id => {
                            return Err(Error::KeyCollision {
                                persistence_key: key.persistence_key.clone(),
                                instance_id: key.instance_id.clone(),
                                key: mapping_key.clone(),
                                owner: Some(owner.clone()),
                            });
                        }
                        _ => {}
                    }
                }
                self.remove_keys(key);
                for mapping_key in keys {
                    self.key_owners.insert(
                        (key.persistence_key.clone(), mapping_key.clone()),
                        key.instance_id.clone(),
                    );
                }
                if !keys.is_empty() {
                    self.owned_keys.insert(key.clone(), keys.clone());
                }
            }
            Write::DeleteKeys { key } => self.remove_keys(key),
            Write::SaveSnapshot { key, snapshot } => {
                let snapshots = self.snapshots.entry(key.clone()).or_default();
                snapshots.retain(|existing| existing.revision != snapshot.revision);
                snapshots.push(snapshot.clone());
            }
            Write::DeleteSnapshots { key } => {
                self.snapshots.remove(key);
            }
            Write::EnqueueOutbox {
                causation_id,
                envelopes,
            } => {
                for envelope in envelopes {
                    self.outbox.insert(
                        envelope.message_id(),
                        OutboxEntry {
                            envelope: envelope.clone(),
                            causation_id: *causation_id,
                            attempts: 0,
                            last_error: None,
                            locked_until: None,
                            created_at: now,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn remove_keys(&mut self, key: &InstanceKey) {
        if let Some(keys) = self.owned_keys.remove(key) {
            for mapping_key in keys {
                self.key_owners
                    .remove(&(key.persistence_key.clone(), mapping_key));
            }
        }
    }
}

fn revision_conflict(key: &InstanceKey, expected: u64, actual: Option<u64>) -> Error {
    Error::RevisionConflict {
        persistence_key: key.persistence_key.clone(),
        instance_id: key.instance_id.clone(),
        expected,
        actual,
    }
}

fn page(records: &[Arc<StreamRecord>], from_offset: u64, limit: u32) -> Vec<StreamRecord> {
    records
        .iter()
        .skip(usize::try_from(from_offset).unwrap_or(usize::MAX))
        .take(limit as usize)
        .map(|record| StreamRecord::clone(record))
        .collect()
}

impl Store for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let working = self.shared.lock().await.clone();
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            working,
            writes: Vec::new(),
        })
    }
}

impl MessageStore for MemoryStore {
    async fn append_messages(
        &self,
        tx: &mut MemoryTransaction,
        stream: &str,
        expected_offset: u64,
        envelopes: NonEmpty<Envelope>,
    ) -> Result<()> {
        tx.stage(Write::Append {
            stream: stream.to_owned(),
            expected_offset,
            envelopes: envelopes.into(),
        })
    }

    async fn stream_length(&self, stream: &str) -> Result<u64> {
        Ok(self.shared.lock().await.stream_length(stream))
    }

    async fn fetch_stream_page(
        &self,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> Result<Vec<StreamRecord>> {
        let state = self.shared.lock().await;
        Ok(state
            .streams
            .get(stream)
            .map(|records| page(records, from_offset, limit))
            .unwrap_or_default())
    }

    async fn fetch_stream_page_in_tx(
        &self,
        tx: &mut MemoryTransaction,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> Result<Vec<StreamRecord>> {
        Ok(tx
            .working
            .streams
            .get(stream)
            .map(|records| page(records, from_offset, limit))
            .unwrap_or_default())
    }

    async fn fetch_global_page(&self, from_offset: u64, limit: u32) -> Result<Vec<StreamRecord>> {
        let state = self.shared.lock().await;
        Ok(page(&state.global, from_offset, limit))
    }

    fn stream_config(&self) -> &StreamConfig {
        &self.config
    }
}

impl InstanceRepository for MemoryStore {
    async fn load_instance(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<StoredInstance>> {
        let key = InstanceKey::new(persistence_key, instance_id);
        Ok(tx.working.instances.get(&key).cloned())
    }

    async fn save_instance(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected_revision: u64,
        data: &Value,
    ) -> Result<()> {
        tx.stage(Write::SaveInstance {
            key: InstanceKey::new(persistence_key, instance_id),
            expected_revision,
            data: data.clone(),
        })
    }

    async fn delete_instance(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected_revision: u64,
    ) -> Result<()> {
        tx.stage(Write::DeleteInstance {
            key: InstanceKey::new(persistence_key, instance_id),
            expected_revision,
        })
    }
}

impl KeySetRepository for MemoryStore {
    async fn find_instance_by_key(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        mapping_key: &str,
    ) -> Result<Option<InstanceId>> {
        Ok(tx
            .working
            .key_owners
            .get(&(persistence_key.to_owned(), mapping_key.to_owned()))
            .cloned())
    }

    async fn replace_keys(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        tx.stage(Write::ReplaceKeys {
            key: InstanceKey::new(persistence_key, instance_id),
            keys: keys.clone(),
        })
    }

    async fn delete_keys(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<()> {
        tx.stage(Write::DeleteKeys {
            key: InstanceKey::new(persistence_key, instance_id),
        })
    }
}

impl SnapshotRepository for MemoryStore {
    async fn load_snapshot(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<Snapshot>> {
        let key = InstanceKey::new(persistence_key, instance_id);
        Ok(tx
            .working
            .snapshots
            .get(&key)
            .and_then(|snapshots| snapshots.iter().max_by_key(|s| s.revision))
            .cloned())
    }

    async fn save_snapshot(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        snapshot: Snapshot,
    ) -> Result<()> {
        tx.stage(Write::SaveSnapshot {
            key: InstanceKey::new(persistence_key, instance_id),
            snapshot,
        })
    }

    async fn delete_snapshots(
        &self,
        tx: &mut MemoryTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<()> {
        tx.stage(Write::DeleteSnapshots {
            key: InstanceKey::new(persistence_key, instance_id),
        })
    }
}

impl OutboxRepository for MemoryStore {
    async fn enqueue_outbox(
        &self,
        tx: &mut MemoryTransaction,
        causation_id: MessageId,
        envelopes: NonEmpty<Envelope>,
    ) -> Result<()> {
        tx.stage(Write::EnqueueOutbox {
            causation_id,
            envelopes: envelopes.into(),
        })
    }

    async fn claim_outbox_message(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        max_attempts: u32,
    ) -> Result<Option<OutboxMessage>> {
        let mut state = self.shared.lock().await;
        let now = OffsetDateTime::now_utc();

        let Some(entry) = state.outbox.values_mut().find(|entry| {
            entry.attempts < max_attempts
                && entry.envelope.send_at() <= now
                && entry.locked_until.is_none_or(|until| until <= now)
        }) else {
            return Ok(None);
        };

        entry.locked_until = Some(now + lock_duration);
        debug!(%worker_id, message_id = %entry.envelope.message_id(), "Outbox message claimed");

        Ok(Some(OutboxMessage {
            envelope: entry.envelope.clone(),
            causation_id: entry.causation_id,
            attempts: entry.attempts,
            created_at: entry.created_at,
        }))
    }

    async fn mark_delivered(&self, message_id: MessageId) -> Result<()> {
        self.shared.lock().await.outbox.remove(&message_id);
        Ok(())
    }

    async fn record_delivery_failure(
        &self,
        message_id: MessageId,
        error: &str,
        backoff: Duration,
    ) -> Result<()> {
        let mut state = self.shared.lock().await;
        if let Some(entry) = state.outbox.get_mut(&message_id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_owned());
            entry.locked_until = Some(OffsetDateTime::now_utc() + backoff);
        }
        Ok(())
    }

    async fn record_permanent_failure(
        &self,
        message_id: MessageId,
        error: &str,
        max_attempts: u32,
    ) -> Result<()> {
        let mut state = self.shared.lock().await;
        if let Some(entry) = state.outbox.get_mut(&message_id) {
            entry.attempts = max_attempts;
            entry.last_error = Some(error.to_owned());
            entry.locked_until = None;
        }
        Ok(())
    }

    async fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetter>> {
        let state = self.shared.lock().await;
        Ok(state
            .outbox
            .values()
            .rev()
            .filter(|entry| entry.attempts >= max_attempts)
            .filter(|entry| query.matches(&entry.envelope, entry.causation_id))
            .take(query.effective_limit() as usize)
            .map(|entry| DeadLetter {
                envelope: entry.envelope.clone(),
                causation_id: entry.causation_id,
                attempts: entry.attempts,
                last_error: entry.last_error.clone(),
                created_at: entry.created_at,
            })
            .collect())
    }

    async fn retry_dead_letter(&self, message_id: MessageId) -> Result<bool> {
        let mut state = self.shared.lock().await;
        let Some(entry) = state.outbox.get_mut(&message_id) else {
            return Ok(false);
        };
        entry.attempts = 0;
        entry.last_error = None;
        entry.locked_until = None;
        Ok(true)
    }
}

impl ProjectionStore for MemoryStore {
    async fn load_projection_position(&self, projection_name: &str) -> Result<u64> {
        let state = self.shared.lock().await;
        Ok(state
            .projections
            .get(projection_name)
            .copied()
            .unwrap_or_default())
    }

    async fn store_projection_position(
        &self,
        projection_name: &str,
        next_offset: u64,
    ) -> Result<()> {
        self.shared
            .lock()
            .await
            .projections
            .insert(projection_name.to_owned(), next_offset);
        Ok(())
    }
}

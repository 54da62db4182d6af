//! Storage abstraction for messages, saga instances, mappings and the outbox.
//!
//! This module provides the [`Store`] and [`Transaction`] traits plus one
//! repository trait per concern. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process storage with optimistic transactions
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)
//!
//! Repository operations that change state take the caller's transaction, so
//! a saga's state change, its mapping update and the messages it produced
//! commit or roll back together.

mod memory;
mod outbox;
#[cfg(feature = "postgres")]
mod postgres;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use nonempty::NonEmpty;
use serde_json::Value;

pub use memory::{MemoryStore, MemoryTransaction};
pub use outbox::{DeadLetter, DeadLetterQuery, OutboxMessage};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgTransaction};

use crate::envelope::{Envelope, MessageId};
use crate::error::Result;
use crate::saga::InstanceId;
use crate::stream::{Stream, StreamConfig};

/// A transactional backend.
///
/// Implementations must guarantee that every write performed through one
/// transaction becomes visible atomically on [`Transaction::commit`], and
/// that dropping an uncommitted transaction discards its writes.
pub trait Store: Send + Sync + Clone + 'static {
    /// The transaction type returned by this store.
    type Tx: Transaction;

    /// Begin a transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// An open transaction.
pub trait Transaction: Send {
    /// Commit all writes made through this transaction.
    ///
    /// Fails with a conflict error if an optimistic-concurrency check no
    /// longer holds at commit time; nothing is written in that case.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard all writes made through this transaction.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

/// A record in a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Stream the record was appended to.
    pub stream: String,
    /// Zero-based position within the stream.
    pub stream_offset: u64,
    /// Zero-based position across all streams, in commit order.
    pub global_offset: u64,
    pub envelope: Envelope,
}

/// Append-only message log with per-stream offsets and one global order.
///
/// Offsets in a stream are gap-free and start at zero. Global offsets are
/// gap-free across all streams and follow commit order: a batch that commits
/// later always receives larger global offsets.
pub trait MessageStore: Store {
    /// Append a batch to `stream`.
    ///
    /// Fails with [`Error::OffsetConflict`](crate::Error::OffsetConflict)
    /// unless `expected_offset` equals the stream's current length; the stream
    /// is left untouched in that case. On success the batch occupies stream
    /// offsets `expected_offset..expected_offset + len` and a contiguous block
    /// of global offsets reserved in the same transaction.
    fn append_messages(
        &self,
        tx: &mut Self::Tx,
        stream: &str,
        expected_offset: u64,
        envelopes: NonEmpty<Envelope>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Number of committed records in `stream`.
    fn stream_length(&self, stream: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Fetch up to `limit` committed records of `stream` from `from_offset`.
    fn fetch_stream_page(
        &self,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<StreamRecord>>> + Send;

    /// Fetch up to `limit` records of `stream` from `from_offset` as `tx` sees
    /// them, including records `tx` appended and has not committed yet.
    ///
    /// Runs on the transaction's own connection.
    fn fetch_stream_page_in_tx(
        &self,
        tx: &mut Self::Tx,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<StreamRecord>>> + Send;

    /// Fetch up to `limit` committed records of the global log from `from_offset`.
    fn fetch_global_page(
        &self,
        from_offset: u64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<StreamRecord>>> + Send;

    /// Paging and polling settings for readers opened on this store.
    fn stream_config(&self) -> &StreamConfig;

    /// Open a reader on `stream` starting at `from_offset`.
    ///
    /// The flag reports whether the stream has any records yet.
    fn open_stream(
        &self,
        stream: &str,
        from_offset: u64,
    ) -> impl Future<Output = Result<(Stream<Self>, bool)>> + Send
    where
        Self: Sized,
    {
        let stream = stream.to_owned();
        async move {
            let exists = self.stream_length(&stream).await? > 0;
            let reader = Stream::for_stream(self.clone(), stream, from_offset);
            Ok((reader, exists))
        }
    }

    /// Open a reader on the global log starting at `from_offset`.
    fn open_global(&self, from_offset: u64) -> Stream<Self>
    where
        Self: Sized,
    {
        Stream::global(self.clone(), from_offset)
    }
}

/// A persisted CRUD instance record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInstance {
    pub revision: u64,
    pub data: Value,
}

/// Full-snapshot persistence of saga instances with revision checks.
pub trait InstanceRepository: Store {
    /// Load an instance record, or `None` if the instance does not exist.
    fn load_instance(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> impl Future<Output = Result<Option<StoredInstance>>> + Send;

    /// Store `data` at `expected_revision + 1`.
    ///
    /// With `expected_revision == 0` the record must not exist yet; otherwise
    /// the stored revision must equal `expected_revision`. Any mismatch is a
    /// [`Error::RevisionConflict`](crate::Error::RevisionConflict).
    fn save_instance(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected_revision: u64,
        data: &Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a record stored at `expected_revision`.
    fn delete_instance(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected_revision: u64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Disjoint key sets routing messages to instances.
pub trait KeySetRepository: Store {
    /// Find the instance owning `mapping_key`.
    fn find_instance_by_key(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        mapping_key: &str,
    ) -> impl Future<Output = Result<Option<InstanceId>>> + Send;

    /// Replace the instance's key set with `keys`.
    ///
    /// Fails with [`Error::KeyCollision`](crate::Error::KeyCollision) if any
    /// key is owned by another instance of the same persistence key.
    fn replace_keys(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
        keys: &BTreeSet<String>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove every key owned by the instance.
    fn delete_keys(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A point-in-time materialization of event-sourced instance data.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Number of events folded into `data`.
    pub revision: u64,
    pub data: Value,
}

/// Snapshot storage for event-sourced instances.
pub trait SnapshotRepository: Store {
    /// Load the snapshot with the highest revision.
    fn load_snapshot(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> impl Future<Output = Result<Option<Snapshot>>> + Send;

    fn save_snapshot(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove all snapshots of the instance.
    fn delete_snapshots(
        &self,
        tx: &mut Self::Tx,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Durable holding area for outbound messages.
///
/// # Locking Protocol
///
/// Messages are claimed using lease locking:
/// 1. `claim_outbox_message` atomically selects and locks a due message
/// 2. The message is locked for `lock_duration`
/// 3. `mark_delivered` or `record_delivery_failure` must be called before the lock expires
/// 4. If a relay crashes, the lock expires and another relay can claim it
pub trait OutboxRepository: Store {
    /// Persist messages produced while handling `causation_id`.
    fn enqueue_outbox(
        &self,
        tx: &mut Self::Tx,
        causation_id: MessageId,
        envelopes: NonEmpty<Envelope>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Claim the next due, undelivered message.
    ///
    /// Messages whose `send_at` is in the future, that are locked, or where
    /// `attempts >= max_attempts` are skipped.
    fn claim_outbox_message(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Option<OutboxMessage>>> + Send;

    /// Mark a message as delivered.
    fn mark_delivered(&self, message_id: MessageId) -> impl Future<Output = Result<()>> + Send;

    /// Record a failed delivery and delay the next attempt by `backoff`.
    fn record_delivery_failure(
        &self,
        message_id: MessageId,
        error: &str,
        backoff: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Record a failure that exhausts all attempts, dead-lettering the message.
    fn record_permanent_failure(
        &self,
        message_id: MessageId,
        error: &str,
        max_attempts: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Fetch dead-lettered messages matching the query.
    fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Vec<DeadLetter>>> + Send;

    /// Reset a dead letter so it is delivered again.
    ///
    /// Returns `Ok(false)` if the message was not found or already delivered.
    fn retry_dead_letter(&self, message_id: MessageId)
    -> impl Future<Output = Result<bool>> + Send;
}

/// Checkpoint storage for projection workers.
pub trait ProjectionStore: Send + Sync + Clone + 'static {
    /// Load the next global offset a projection should read (0 if new).
    fn load_projection_position(
        &self,
        projection_name: &str,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Persist the next global offset a projection should read.
    fn store_projection_position(
        &self,
        projection_name: &str,
        next_offset: u64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Name of the stream holding an event-sourced instance's events.
pub fn instance_stream(persistence_key: &str, instance_id: &InstanceId) -> String {
    format!("{persistence_key}:{instance_id}")
}

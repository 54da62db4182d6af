//! PostgreSQL store implementation.

use std::collections::BTreeSet;
use std::time::Duration;

use nonempty::NonEmpty;
use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use tracing::{debug, trace};
use uuid::Uuid;

use super::outbox::{DeadLetter, DeadLetterQuery, OutboxMessage};
use super::{
    InstanceRepository, KeySetRepository, MessageStore, OutboxRepository, ProjectionStore,
    Snapshot, SnapshotRepository, Store, StoredInstance, StreamRecord, Transaction,
};
use crate::envelope::{Envelope, Message, MessageId, MessageKind};
use crate::error::{Error, Result};
use crate::saga::InstanceId;
use crate::stream::StreamConfig;

/// PostgreSQL-backed store for production use.
///
/// Optimistic checks are conditional writes: an append only succeeds if the
/// stream's length still equals the expected offset, and an instance update
/// only if its revision still matches. A concurrent writer blocks on the row
/// until the first commits, then fails its check with a conflict error.
///
/// # Database Schema
///
/// Requires tables in the `saga` schema (see [`PgStore::migrate`]):
///
/// | Table                  | Purpose                                          |
/// |------------------------|--------------------------------------------------|
/// | `global_position`      | Next global offset; serializes appenders         |
/// | `streams`              | Per-stream length used for the offset check      |
/// | `messages`             | Append-only log with stream and global offsets   |
/// | `instances`            | CRUD instance records with revisions             |
/// | `instance_keys`        | Key-set mappings                                 |
/// | `snapshots`            | Event-sourced instance snapshots                 |
/// | `outbox`               | Outbound messages awaiting delivery              |
/// | `projection_positions` | Projection checkpoints                           |
///
/// # Global Order
///
/// An appending transaction reserves its block of global offsets by updating
/// the single `global_position` row and holds that row lock until it commits.
/// A later appender waits for the lock, so its offsets are larger than every
/// committed one and readers never observe a gap being filled. The price is
/// that appends to the log are serialized.
///
/// # Example
///
/// ```ignore
/// use ironsaga::PgStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    stream_config: StreamConfig,
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stream_config: StreamConfig::default(),
        }
    }

    /// Use `config` for stream readers opened on this store.
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// An open PostgreSQL transaction.
pub struct PgTransaction(sqlx::Transaction<'static, Postgres>);

impl PgTransaction {
    /// The underlying connection, for running custom queries in the same transaction.
    pub fn connection(&mut self) -> &mut sqlx::PgConnection {
        &mut *self.0
    }
}

impl Store for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        Ok(PgTransaction(self.pool.begin().await?))
    }
}

impl Transaction for PgTransaction {
    async fn commit(self) -> Result<()> {
        self.0.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.0.rollback().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    global_offset: i64,
    stream: String,
    stream_offset: i64,
    message_id: Uuid,
    causation_id: Uuid,
    correlation_id: Uuid,
    kind: String,
    message_type: String,
    payload: Value,
    created_at: OffsetDateTime,
    send_at: OffsetDateTime,
}

impl TryFrom<MessageRow> for StreamRecord {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let kind = MessageKind::parse(&row.kind).ok_or_else(|| Error::DataIntegrity {
            stream: row.stream.clone(),
            offset: row.stream_offset as u64,
            reason: format!("unknown message kind {:?}", row.kind),
        })?;

        let envelope = Envelope::from_parts(
            MessageId::from_uuid(row.message_id),
            MessageId::from_uuid(row.causation_id),
            MessageId::from_uuid(row.correlation_id),
            row.created_at,
            row.send_at,
            Message::from_parts(kind, row.message_type, row.payload),
        );

        Ok(StreamRecord {
            stream: row.stream,
            stream_offset: row.stream_offset as u64,
            global_offset: row.global_offset as u64,
            envelope,
        })
    }
}

const MESSAGE_COLUMNS: &str = "global_offset, stream, stream_offset, message_id, causation_id, \
     correlation_id, kind, message_type, payload, created_at, send_at";

impl MessageStore for PgStore {
    async fn append_messages(
        &self,
        tx: &mut PgTransaction,
        stream: &str,
        expected_offset: u64,
        envelopes: NonEmpty<Envelope>,
    ) -> Result<()> {
        let count = envelopes.len() as i64;

        // Reserve the global block first; the row lock is held until commit.
        let first_global: i64 = sqlx::query_scalar(
            r#"
            UPDATE saga.global_position
            SET next_offset = next_offset + $1
            RETURNING next_offset - $1
            "#,
        )
        .bind(count)
        .fetch_one(&mut *tx.0)
        .await?;

        sqlx::query("INSERT INTO saga.streams (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(stream)
            .execute(&mut *tx.0)
            .await?;

        let advanced = sqlx::query(
            r#"
            UPDATE saga.streams
            SET length = length + $3
            WHERE name = $1 AND length = $2
            "#,
        )
        .bind(stream)
        .bind(expected_offset as i64)
        .bind(count)
        .execute(&mut *tx.0)
        .await?;

        if advanced.rows_affected() == 0 {
            let actual: i64 = sqlx::query_scalar("SELECT length FROM saga.streams WHERE name = $1")
                .bind(stream)
                .fetch_one(&mut *tx.0)
                .await?;
            return Err(Error::OffsetConflict {
                stream: stream.to_owned(),
                expected: expected_offset,
                actual: actual as u64,
            });
        }

        for (i, envelope) in envelopes.iter().enumerate() {
            let message = envelope.message();
            sqlx::query(
                r#"
                INSERT INTO saga.messages
                    (global_offset, stream, stream_offset, message_id, causation_id,
                     correlation_id, kind, message_type, payload, created_at, send_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(first_global + i as i64)
            .bind(stream)
            .bind(expected_offset as i64 + i as i64)
            .bind(envelope.message_id().as_uuid())
            .bind(envelope.causation_id().as_uuid())
            .bind(envelope.correlation_id().as_uuid())
            .bind(message.kind().as_str())
            .bind(message.message_type())
            .bind(message.payload())
            .bind(envelope.created_at())
            .bind(envelope.send_at())
            .execute(&mut *tx.0)
            .await?;
        }

        trace!(stream, from = expected_offset, count, first_global, "Appended messages");
        Ok(())
    }

    async fn stream_length(&self, stream: &str) -> Result<u64> {
        let length: Option<i64> =
            sqlx::query_scalar("SELECT length FROM saga.streams WHERE name = $1")
                .bind(stream)
                .fetch_optional(&self.pool)
                .await?;
        Ok(length.unwrap_or(0) as u64)
    }

    async fn fetch_stream_page(
        &self,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> Result<Vec<StreamRecord>> {
        Self::stream_page(&self.pool, stream, from_offset, limit).await
    }

    async fn fetch_stream_page_in_tx(
        &self,
        tx: &mut PgTransaction,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> Result<Vec<StreamRecord>> {
        Self::stream_page(&mut *tx.0, stream, from_offset, limit).await
    }

    async fn fetch_global_page(&self, from_offset: u64, limit: u32) -> Result<Vec<StreamRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM saga.messages
            WHERE global_offset >= $1
            ORDER BY global_offset
            LIMIT $2
            "#
        ))
        .bind(from_offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StreamRecord::try_from).collect()
    }

    fn stream_config(&self) -> &StreamConfig {
        &self.stream_config
    }
}

impl PgStore {
    async fn stream_page<'e, E>(
        executor: E,
        stream: &str,
        from_offset: u64,
        limit: u32,
    ) -> Result<Vec<StreamRecord>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM saga.messages
            WHERE stream = $1 AND stream_offset >= $2
            ORDER BY stream_offset
            LIMIT $3
            "#
        ))
        .bind(stream)
        .bind(from_offset as i64)
        .bind(limit as i64)
        .fetch_all(executor)
        .await?;

        rows.into_iter().map(StreamRecord::try_from).collect()
    }

    async fn current_revision(
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<u64>> {
        let revision: Option<i64> = sqlx::query_scalar(
            "SELECT revision FROM saga.instances WHERE persistence_key = $1 AND instance_id = $2",
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .fetch_optional(&mut *tx.0)
        .await?;
        Ok(revision.map(|r| r as u64))
    }

    async fn revision_conflict(
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected: u64,
    ) -> Error {
        match Self::current_revision(tx, persistence_key, instance_id).await {
            Ok(actual) => Error::RevisionConflict {
                persistence_key: persistence_key.to_owned(),
                instance_id: instance_id.clone(),
                expected,
                actual,
            },
            Err(err) => err,
        }
    }
}

impl InstanceRepository for PgStore {
    async fn load_instance(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<StoredInstance>> {
        let row: Option<(i64, Value)> = sqlx::query_as(
            r#"
            SELECT revision, data
            FROM saga.instances
            WHERE persistence_key = $1 AND instance_id = $2
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .fetch_optional(&mut *tx.0)
        .await?;

        Ok(row.map(|(revision, data)| StoredInstance {
            revision: revision as u64,
            data,
        }))
    }

    async fn save_instance(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected_revision: u64,
        data: &Value,
    ) -> Result<()> {
        let written = if expected_revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO saga.instances (persistence_key, instance_id, revision, data)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(persistence_key)
            .bind(instance_id.as_str())
            .bind(data)
            .execute(&mut *tx.0)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE saga.instances
                SET revision = revision + 1,
                    data = $4,
                    updated_at = now()
                WHERE persistence_key = $1 AND instance_id = $2 AND revision = $3
                "#,
            )
            .bind(persistence_key)
            .bind(instance_id.as_str())
            .bind(expected_revision as i64)
            .bind(data)
            .execute(&mut *tx.0)
            .await?
        };

        if written.rows_affected() == 0 {
            return Err(
                Self::revision_conflict(tx, persistence_key, instance_id, expected_revision).await,
            );
        }
        Ok(())
    }

    async fn delete_instance(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        expected_revision: u64,
    ) -> Result<()> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM saga.instances
            WHERE persistence_key = $1 AND instance_id = $2 AND revision = $3
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .bind(expected_revision as i64)
        .execute(&mut *tx.0)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(
                Self::revision_conflict(tx, persistence_key, instance_id, expected_revision).await,
            );
        }
        Ok(())
    }
}

impl KeySetRepository for PgStore {
    async fn find_instance_by_key(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        mapping_key: &str,
    ) -> Result<Option<InstanceId>> {
        let owner: Option<String> = sqlx::query_scalar(
            r#"
            SELECT instance_id
            FROM saga.instance_keys
            WHERE persistence_key = $1 AND mapping_key = $2
            "#,
        )
        .bind(persistence_key)
        .bind(mapping_key)
        .fetch_optional(&mut *tx.0)
        .await?;
        Ok(owner.map(InstanceId::from))
    }

    async fn replace_keys(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        let keys: Vec<String> = keys.iter().cloned().collect();

        sqlx::query(
            r#"
            DELETE FROM saga.instance_keys
            WHERE persistence_key = $1 AND instance_id = $2 AND NOT (mapping_key = ANY($3))
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .bind(&keys)
        .execute(&mut *tx.0)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO saga.instance_keys (persistence_key, mapping_key, instance_id)
            SELECT $1, key, $2 FROM unnest($3::text[]) AS key
            ON CONFLICT (persistence_key, mapping_key) DO NOTHING
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .bind(&keys)
        .execute(&mut *tx.0)
        .await?;

        // Keys that were already owned elsewhere were skipped by the insert.
        let collision: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT mapping_key, instance_id
            FROM saga.instance_keys
            WHERE persistence_key = $1 AND mapping_key = ANY($3) AND instance_id <> $2
            ORDER BY mapping_key
            LIMIT 1
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .bind(&keys)
        .fetch_optional(&mut *tx.0)
        .await?;

        if let Some((key, owner)) = collision {
            return Err(Error::KeyCollision {
                persistence_key: persistence_key.to_owned(),
                instance_id: instance_id.clone(),
                key,
                owner: Some(InstanceId::from(owner)),
            });
        }
        Ok(())
    }

    async fn delete_keys(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM saga.instance_keys WHERE persistence_key = $1 AND instance_id = $2",
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .execute(&mut *tx.0)
        .await?;
        Ok(())
    }
}

impl SnapshotRepository for PgStore {
    async fn load_snapshot(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<Snapshot>> {
        let row: Option<(i64, Value)> = sqlx::query_as(
            r#"
            SELECT revision, data
            FROM saga.snapshots
            WHERE persistence_key = $1 AND instance_id = $2
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .fetch_optional(&mut *tx.0)
        .await?;

        Ok(row.map(|(revision, data)| Snapshot {
            revision: revision as u64,
            data,
        }))
    }

    async fn save_snapshot(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
        snapshot: Snapshot,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga.snapshots (persistence_key, instance_id, revision, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (persistence_key, instance_id, revision)
            DO UPDATE SET data = EXCLUDED.data, created_at = now()
            "#,
        )
        .bind(persistence_key)
        .bind(instance_id.as_str())
        .bind(snapshot.revision as i64)
        .bind(&snapshot.data)
        .execute(&mut *tx.0)
        .await?;
        Ok(())
    }

    async fn delete_snapshots(
        &self,
        tx: &mut PgTransaction,
        persistence_key: &str,
        instance_id: &InstanceId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM saga.snapshots WHERE persistence_key = $1 AND instance_id = $2")
            .bind(persistence_key)
            .bind(instance_id.as_str())
            .execute(&mut *tx.0)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    causation_id: Uuid,
    envelope: Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: OffsetDateTime,
}

impl OutboxRow {
    fn envelope(&self) -> Result<Envelope> {
        Ok(Envelope::deserialize(&self.envelope)?)
    }
}

impl OutboxRepository for PgStore {
    async fn enqueue_outbox(
        &self,
        tx: &mut PgTransaction,
        causation_id: MessageId,
        envelopes: NonEmpty<Envelope>,
    ) -> Result<()> {
        for envelope in envelopes.iter() {
            sqlx::query(
                r#"
                INSERT INTO saga.outbox (message_id, causation_id, message_type, envelope, send_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(envelope.message_id().as_uuid())
            .bind(causation_id.as_uuid())
            .bind(envelope.message().message_type())
            .bind(serde_json::to_value(envelope)?)
            .bind(envelope.send_at())
            .execute(&mut *tx.0)
            .await?;
        }
        Ok(())
    }

    async fn claim_outbox_message(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        max_attempts: u32,
    ) -> Result<Option<OutboxMessage>> {
        // FOR UPDATE SKIP LOCKED keeps concurrent relays off the same row.
        // Lock timestamps are computed in the database to avoid clock skew.
        let row: Option<OutboxRow> = sqlx::query_as(
            r#"
            UPDATE saga.outbox
            SET locked_until = now() + ($1 * interval '1 second'),
                locked_by = $2
            WHERE seq = (
                SELECT seq FROM saga.outbox
                WHERE delivered_at IS NULL
                  AND attempts < $3
                  AND send_at <= now()
                  AND (locked_until IS NULL OR locked_until <= now())
                ORDER BY seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING causation_id, envelope, attempts, last_error, created_at
            "#,
        )
        .bind(lock_duration.as_secs_f64())
        .bind(worker_id)
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let envelope = row.envelope()?;
        debug!(%worker_id, message_id = %envelope.message_id(), "Outbox message claimed");
        Ok(Some(OutboxMessage {
            envelope,
            causation_id: MessageId::from_uuid(row.causation_id),
            attempts: row.attempts as u32,
            created_at: row.created_at,
        }))
    }

    async fn mark_delivered(&self, message_id: MessageId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga.outbox
            SET delivered_at = now(),
                locked_until = NULL,
                locked_by = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery_failure(
        &self,
        message_id: MessageId,
        error: &str,
        backoff: Duration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga.outbox
            SET attempts = attempts + 1,
                last_error = $2,
                locked_until = now() + ($3 * interval '1 second'),
                locked_by = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(error)
        .bind(backoff.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_permanent_failure(
        &self,
        message_id: MessageId,
        error: &str,
        max_attempts: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga.outbox
            SET attempts = $2,
                last_error = $3,
                locked_until = NULL,
                locked_by = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(max_attempts as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetter>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT causation_id, envelope, attempts, last_error, created_at
            FROM saga.outbox
            WHERE delivered_at IS NULL
              AND attempts >= $1
              AND ($2::text IS NULL OR message_type = $2)
              AND ($3::uuid IS NULL OR causation_id = $3)
            ORDER BY seq DESC
            LIMIT $4
            "#,
        )
        .bind(max_attempts as i32)
        .bind(query.message_type.as_deref())
        .bind(query.causation_id.map(|id| *id.as_uuid()))
        .bind(query.effective_limit() as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetter {
                    envelope: row.envelope()?,
                    causation_id: MessageId::from_uuid(row.causation_id),
                    attempts: row.attempts as u32,
                    last_error: row.last_error,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn retry_dead_letter(&self, message_id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE saga.outbox
            SET attempts = 0,
                locked_until = NULL,
                locked_by = NULL,
                last_error = NULL
            WHERE message_id = $1
              AND delivered_at IS NULL
            "#,
        )
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

impl ProjectionStore for PgStore {
    async fn load_projection_position(&self, projection_name: &str) -> Result<u64> {
        let position: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM saga.projection_positions WHERE projection_name = $1",
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position.unwrap_or(0) as u64)
    }

    async fn store_projection_position(
        &self,
        projection_name: &str,
        next_offset: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga.projection_positions (projection_name, next_offset)
            VALUES ($1, $2)
            ON CONFLICT (projection_name)
            DO UPDATE SET next_offset = EXCLUDED.next_offset, updated_at = now()
            "#,
        )
        .bind(projection_name)
        .bind(next_offset as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

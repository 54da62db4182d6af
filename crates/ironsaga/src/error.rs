//! Error types for ironsaga.

use std::time::Duration;

use thiserror::Error;

use crate::saga::InstanceId;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ironsaga operations.
///
/// Routing misses and not-found instances are not errors; they are reported as
/// [`HandleOutcome`](crate::HandleOutcome) variants. Everything here aborts the
/// current transaction and is returned unchanged to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize a payload, instance data or snapshot.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message payload could not be decoded into the type a saga expects.
    #[error("failed to decode message of type {message_type}: {source}")]
    MessageDecode {
        /// The `type` tag carried by the message.
        message_type: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A payload did not serialize to a JSON object with a string `type` tag.
    #[error("message payload has no string \"type\" tag")]
    UntaggedMessage,

    /// An append was attempted at an offset that is not the stream's tail.
    ///
    /// Nothing was written. The caller's view of the stream is stale.
    #[error(
        "offset conflict on stream {stream}: expected offset {expected}, stream is at {actual}"
    )]
    OffsetConflict {
        /// The stream name.
        stream: String,
        /// The offset the caller expected to write at.
        expected: u64,
        /// The stream's actual tail when the conflict was detected.
        actual: u64,
    },

    /// A CRUD save or delete was guarded by a revision that is no longer current.
    #[error(
        "revision conflict for {persistence_key}:{instance_id}: \
         expected revision {expected}, found {}",
        .actual.map_or_else(|| "no record".to_string(), |r| r.to_string())
    )]
    RevisionConflict {
        /// The saga's persistence key.
        persistence_key: String,
        /// The instance whose revision was stale.
        instance_id: InstanceId,
        /// The revision the unit of work loaded.
        expected: u64,
        /// The revision currently stored, if a record exists.
        actual: Option<u64>,
    },

    /// A mapping key is already owned by a different instance of the same saga.
    #[error(
        "mapping key collision for {persistence_key}: \
         key {key:?} requested by {instance_id} is owned by {}",
        .owner.as_ref().map_or_else(|| "another instance".to_string(), |o| o.to_string())
    )]
    KeyCollision {
        /// The saga's persistence key.
        persistence_key: String,
        /// The instance that tried to claim the key.
        instance_id: InstanceId,
        /// The offending mapping key.
        key: String,
        /// The instance that currently owns the key, when known.
        owner: Option<InstanceId>,
    },

    /// Stored data violates an invariant the runtime relies on.
    #[error("data integrity error in stream {stream} at offset {offset}: {reason}")]
    DataIntegrity {
        /// The stream holding the offending record.
        stream: String,
        /// The stream offset of the offending record.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// An event-sourced saga returned a direct state replacement.
    ///
    /// Event-sourced state only changes by applying published events.
    #[error("event-sourced saga {persistence_key} may not replace its data directly")]
    DirectStateMutation {
        /// The saga's persistence key.
        persistence_key: String,
    },

    /// Saga logic reported a failure.
    #[error("saga {persistence_key} failed: {message}")]
    Saga {
        /// The saga's persistence key.
        persistence_key: String,
        /// Description of the failure.
        message: String,
    },

    /// [`Stream::get`](crate::Stream::get) was called before a successful advance.
    #[error("stream cursor is not positioned on a record")]
    StreamNotPositioned,

    /// The stream was read after [`Stream::close`](crate::Stream::close).
    #[error("stream is closed")]
    StreamClosed,

    /// A blocking operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Processing an inbound message exceeded its deadline.
    #[error("message processing timed out after {0:?}")]
    Timeout(Duration),

    /// Delivering an outbound message failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Two sagas were registered under the same persistence key.
    #[error("duplicate saga registration: {0}")]
    DuplicatePersistenceKey(String),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Applying schema migrations failed.
    #[cfg(feature = "postgres")]
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Create a saga failure with context.
    pub fn saga(persistence_key: &str, message: impl Into<String>) -> Self {
        Error::Saga {
            persistence_key: persistence_key.to_string(),
            message: message.into(),
        }
    }

    /// Create a message decode error with context.
    pub fn message_decode(message_type: impl Into<String>, source: serde_json::Error) -> Self {
        Error::MessageDecode {
            message_type: message_type.into(),
            source,
        }
    }

    /// Returns `true` for optimistic-concurrency failures.
    ///
    /// Conflicts mean another unit of work committed first; handling the
    /// message again will observe the newer state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::OffsetConflict { .. } | Error::RevisionConflict { .. }
        )
    }

    /// Returns `true` for failures that retrying the same message cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::DataIntegrity { .. }
                | Error::MessageDecode { .. }
                | Error::UntaggedMessage
                | Error::DirectStateMutation { .. }
        )
    }
}

//! Immutable message envelopes.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier of a message (UUID v7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Whether a message is an instruction or a fact. The two are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An instruction to do something.
    Command,
    /// A fact about something that happened.
    Event,
}

impl MessageKind {
    /// Stable lowercase name, used as the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(MessageKind::Command),
            "event" => Some(MessageKind::Event),
            _ => None,
        }
    }
}

/// A message payload tagged with its kind and type name.
///
/// Payloads are JSON values produced from serde types tagged with
/// `#[serde(tag = "type")]`; the tag becomes the message type used for routing.
///
/// # Example
///
/// ```
/// use ironsaga::{Message, MessageKind};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// #[serde(tag = "type")]
/// enum OrderCommand {
///     PlaceOrder { order_id: String },
/// }
///
/// let message = Message::command(&OrderCommand::PlaceOrder { order_id: "ord-1".into() }).unwrap();
/// assert_eq!(message.kind(), MessageKind::Command);
/// assert_eq!(message.message_type(), "PlaceOrder");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageKind,
    message_type: String,
    payload: Value,
}

impl Message {
    /// Build a command from a `type`-tagged serde value.
    pub fn command<T: Serialize>(value: &T) -> Result<Self> {
        Self::tagged(MessageKind::Command, value)
    }

    /// Build an event from a `type`-tagged serde value.
    pub fn event<T: Serialize>(value: &T) -> Result<Self> {
        Self::tagged(MessageKind::Event, value)
    }

    /// Build a message from raw parts.
    pub fn from_parts(kind: MessageKind, message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            message_type: message_type.into(),
            payload,
        }
    }

    fn tagged<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self> {
        let payload = serde_json::to_value(value)?;
        let message_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or(Error::UntaggedMessage)?
            .to_string();
        Ok(Self {
            kind,
            message_type,
            payload,
        })
    }

    /// Command or event.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns `true` if this message is an event.
    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }

    /// The routing type name.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The JSON payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(|e| Error::message_decode(&self.message_type, e))
    }
}

/// Drop sub-microsecond precision, matching what Postgres stores.
fn to_micros(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_microsecond(at.microsecond()).unwrap_or(at)
}

/// Immutable wrapper around a [`Message`] with identity and lineage metadata.
///
/// Timestamps carry microsecond precision so an envelope read back from
/// storage compares equal to the one written.
///
/// Envelopes are never mutated once created. Messages produced while handling
/// an envelope are wrapped with [`Envelope::new_child`], which records the
/// parent as the causation and inherits its correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,
    causation_id: MessageId,
    correlation_id: MessageId,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    send_at: OffsetDateTime,
    message: Message,
}

impl Envelope {
    /// Wrap a message that starts a new causal chain.
    pub fn new(message: Message) -> Self {
        let message_id = MessageId::generate();
        let created_at = to_micros(OffsetDateTime::now_utc());
        Self {
            message_id,
            causation_id: message_id,
            correlation_id: message_id,
            created_at,
            send_at: created_at,
            message,
        }
    }

    /// Wrap a message caused by this envelope.
    pub fn new_child(&self, message: Message) -> Self {
        let created_at = to_micros(OffsetDateTime::now_utc());
        Self {
            message_id: MessageId::generate(),
            causation_id: self.message_id,
            correlation_id: self.correlation_id,
            created_at,
            send_at: created_at,
            message,
        }
    }

    /// Reassemble an envelope read back from storage.
    pub fn from_parts(
        message_id: MessageId,
        causation_id: MessageId,
        correlation_id: MessageId,
        created_at: OffsetDateTime,
        send_at: OffsetDateTime,
        message: Message,
    ) -> Self {
        Self {
            message_id,
            causation_id,
            correlation_id,
            created_at,
            send_at,
            message,
        }
    }

    /// Copy of this envelope scheduled for `send_at`, never earlier than creation.
    pub fn with_send_at(mut self, send_at: OffsetDateTime) -> Self {
        self.send_at = to_micros(send_at).max(self.created_at);
        self
    }

    /// Copy of this envelope scheduled `delay` after creation.
    pub fn with_delay(self, delay: Duration) -> Self {
        let send_at = self.created_at + delay;
        self.with_send_at(send_at)
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn causation_id(&self) -> MessageId {
        self.causation_id
    }

    pub fn correlation_id(&self) -> MessageId {
        self.correlation_id
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn send_at(&self) -> OffsetDateTime {
        self.send_at
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

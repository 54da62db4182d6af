//! Saga contracts and types.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::envelope::{Envelope, Message};
use crate::error::Result;

/// A long-lived, identity-addressed business process.
///
/// All functions are pure: [`Saga::handle_message`] receives the current
/// instance data and an inbound message, and returns a [`Reaction`]
/// describing the new data and the messages to emit. The runtime persists
/// both in one transaction.
///
/// Inbound messages are decoded into [`Self::Message`], normally an enum
/// tagged with `#[serde(tag = "type")]` whose variant names match the
/// message types declared in [`Saga::message_types`]. Dispatch is a plain
/// `match` over that enum.
///
/// How instance data is persisted is chosen when the saga is registered:
/// [`CrudPersister`](crate::CrudPersister) stores full snapshots of
/// [`Self::Data`]; [`EventSourcedPersister`](crate::EventSourcedPersister)
/// requires [`EventSourcedSaga`] and stores the events the saga publishes.
///
/// # Example
///
/// ```ignore
/// impl Saga for ShippingSaga {
///     type Data = Shipment;
///     type Message = ShippingMessage;
///
///     const PERSISTENCE_KEY: &'static str = "shipping";
///
///     fn message_types() -> MessageTypes {
///         MessageTypes::new(["OrderPlaced"], ["ParcelDelivered"])
///     }
///
///     fn new_data(_id: &InstanceId) -> Shipment {
///         Shipment::default()
///     }
///
///     fn handle_message(data: &Shipment, message: ShippingMessage) -> Result<Reaction<Shipment>> {
///         match message {
///             ShippingMessage::OrderPlaced { order_id } => {
///                 Ok(Reaction::update(Shipment::pending(order_id))
///                     .send(Message::command(&BookCourier { order_id })?))
///             }
///             ShippingMessage::ParcelDelivered { .. } => Ok(Reaction::update(data.delivered())),
///         }
///     }
///
///     fn is_instance_complete(data: &Shipment) -> bool {
///         data.is_delivered()
///     }
/// }
/// ```
pub trait Saga: Send + Sync + 'static {
    /// Process state owned by one instance.
    ///
    /// Compared by value to detect no-op changes, so `PartialEq` should be structural.
    type Data: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync;

    /// Inbound messages this saga understands.
    type Message: DeserializeOwned + Send + Sync;

    /// Identifies this saga's persisted instances, mappings and streams.
    /// Must be stable across deployments.
    const PERSISTENCE_KEY: &'static str;

    /// Message types routed to this saga, split into triggers and non-triggers.
    fn message_types() -> MessageTypes;

    /// Data for an instance that does not exist yet.
    fn new_data(instance_id: &InstanceId) -> Self::Data;

    /// Handle a message for an instance.
    fn handle_message(data: &Self::Data, message: Self::Message) -> Result<Reaction<Self::Data>>;

    /// Whether the instance has finished. Completed instances are removed.
    fn is_instance_complete(data: &Self::Data) -> bool;

    /// Called when a non-trigger message maps to an instance that does not exist.
    ///
    /// Nothing is persisted. Returning an error aborts handling of the message.
    fn handle_not_found(envelope: &Envelope, _message: &Self::Message) -> Result<()> {
        debug!(
            persistence_key = Self::PERSISTENCE_KEY,
            message_id = %envelope.message_id(),
            message_type = envelope.message().message_type(),
            "Instance not found, message ignored"
        );
        Ok(())
    }
}

/// A saga whose state is rebuilt by applying the events it publishes.
pub trait EventSourcedSaga: Saga {
    /// Events recorded in the instance stream.
    type Event: DeserializeOwned + Send;

    /// Apply an event to the instance data.
    ///
    /// Must be deterministic: replaying the same events from the same starting
    /// data always produces the same result.
    fn apply_event(data: &mut Self::Data, event: Self::Event);
}

/// A saga routed through a key-set repository.
///
/// Each instance owns a set of mapping keys derived from its data. A message
/// is routed to whichever instance currently owns the message's mapping key.
/// Key sets of distinct instances are disjoint.
pub trait KeySetSaga: Saga {
    /// The key an inbound message is routed by, if it carries one.
    fn mapping_key(message: &Self::Message) -> Option<String>;

    /// The full set of keys that should route to this instance.
    fn instance_keys(data: &Self::Data) -> BTreeSet<String>;

    /// Identity for a new instance created by an unmapped trigger message.
    fn generate_instance_id(_envelope: &Envelope, _message: &Self::Message) -> InstanceId {
        InstanceId::generate()
    }
}

/// Extracts the instance ID (business key) from a message.
///
/// Used by [`DirectMapper`](crate::DirectMapper). Derivable for enums with
/// `#[derive(HasInstanceId)]`.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, HasInstanceId)]
/// #[serde(tag = "type")]
/// #[instance_id(order_id)]
/// enum OrderMessage {
///     OrderPlaced { order_id: String },
///     #[instance_id(reference)]
///     PaymentReceived { reference: String },
/// }
/// ```
pub trait HasInstanceId {
    /// Returns the instance ID this message addresses.
    fn instance_id(&self) -> InstanceId;
}

/// Message types routed to a saga.
///
/// Triggers may create new instances; non-triggers are only delivered to
/// instances that already exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageTypes {
    triggers: BTreeSet<String>,
    non_triggers: BTreeSet<String>,
}

impl MessageTypes {
    /// Declare trigger and non-trigger message types.
    pub fn new<T, N>(triggers: T, non_triggers: N) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            triggers: triggers.into_iter().map(Into::into).collect(),
            non_triggers: non_triggers.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns `true` if `message_type` may create an instance.
    pub fn is_trigger(&self, message_type: &str) -> bool {
        self.triggers.contains(message_type)
    }

    /// Returns `true` if `message_type` is routed to this saga at all.
    pub fn contains(&self, message_type: &str) -> bool {
        self.triggers.contains(message_type) || self.non_triggers.contains(message_type)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.triggers.iter().map(String::as_str)
    }

    pub fn non_triggers(&self) -> impl Iterator<Item = &str> {
        self.non_triggers.iter().map(String::as_str)
    }
}

/// A saga instance identifier.
///
/// # Example
///
/// ```
/// use ironsaga::InstanceId;
///
/// let id = InstanceId::new("ord-123");
/// assert_eq!(id.as_str(), "ord-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an instance ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered instance ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// One occurrence of a saga with versioned state.
///
/// `revision` is 0 until the instance has been persisted for the first time.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaInstance<D> {
    id: InstanceId,
    revision: u64,
    data: D,
}

impl<D> SagaInstance<D> {
    pub(crate) fn new(id: InstanceId, revision: u64, data: D) -> Self {
        Self { id, revision, data }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// Returns `true` if nothing has been persisted for this instance yet.
    pub fn is_new(&self) -> bool {
        self.revision == 0
    }

    pub(crate) fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// A message emitted by saga logic, optionally delayed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub message: Message,
    pub delay: Option<Duration>,
}

/// The result of handling one message.
///
/// CRUD sagas replace their data with [`Reaction::update`]; event-sourced
/// sagas leave data alone and publish events, which the runtime applies.
#[derive(Debug, Clone)]
pub struct Reaction<D> {
    update: Option<D>,
    outgoing: Vec<Outgoing>,
}

impl<D> Default for Reaction<D> {
    fn default() -> Self {
        Self::none()
    }
}

impl<D> Reaction<D> {
    /// No state change, no messages.
    pub fn none() -> Self {
        Self {
            update: None,
            outgoing: vec![],
        }
    }

    /// Replace the instance data.
    pub fn update(data: D) -> Self {
        Self {
            update: Some(data),
            outgoing: vec![],
        }
    }

    /// Emit a command or event.
    pub fn send(mut self, message: Message) -> Self {
        self.outgoing.push(Outgoing {
            message,
            delay: None,
        });
        self
    }

    /// Emit a message to be delivered after `delay`.
    pub fn send_after(mut self, delay: Duration, message: Message) -> Self {
        self.outgoing.push(Outgoing {
            message,
            delay: Some(delay),
        });
        self
    }

    /// Emit several messages.
    pub fn send_all(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.outgoing.extend(messages.into_iter().map(|message| Outgoing {
            message,
            delay: None,
        }));
        self
    }

    /// The replacement data, if any.
    pub fn updated_data(&self) -> Option<&D> {
        self.update.as_ref()
    }

    /// Messages to emit, in order.
    pub fn outgoing(&self) -> &[Outgoing] {
        &self.outgoing
    }

    pub(crate) fn into_parts(self) -> (Option<D>, Vec<Outgoing>) {
        (self.update, self.outgoing)
    }
}

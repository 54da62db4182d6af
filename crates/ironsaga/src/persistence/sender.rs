use std::marker::PhantomData;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::saga::{EventSourcedSaga, Outgoing};

/// A sink for messages produced while handling an inbound message.
pub trait MessageSender: Send {
    fn send(&mut self, envelope: Envelope) -> Result<()>;
}

/// Captures outbound messages until the transaction writes them to the outbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outbound {
    envelopes: Vec<Envelope>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn into_envelopes(self) -> Vec<Envelope> {
        self.envelopes
    }
}

impl MessageSender for Outbound {
    fn send(&mut self, envelope: Envelope) -> Result<()> {
        self.envelopes.push(envelope);
        Ok(())
    }
}

/// Forwards every message and keeps a copy of each event.
#[derive(Debug, Default)]
pub struct RecordingSender<S> {
    inner: S,
    recorded: Vec<Envelope>,
}

impl<S: MessageSender> RecordingSender<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    /// Events recorded since the last call to [`take_recorded`](Self::take_recorded).
    pub fn recorded(&self) -> &[Envelope] {
        &self.recorded
    }

    pub fn take_recorded(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.recorded)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: MessageSender> MessageSender for RecordingSender<S> {
    fn send(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.message().is_event() {
            self.recorded.push(envelope.clone());
        }
        self.inner.send(envelope)
    }
}

/// Applies each published event to instance data before forwarding it.
///
/// Keeps event-sourced data current while a message is handled, so the
/// completion check sees the same state a later replay will produce.
pub struct EventApplyingSender<'a, G: EventSourcedSaga, S> {
    data: &'a mut G::Data,
    inner: &'a mut S,
    _saga: PhantomData<fn() -> G>,
}

impl<'a, G: EventSourcedSaga, S: MessageSender> EventApplyingSender<'a, G, S> {
    pub fn new(data: &'a mut G::Data, inner: &'a mut S) -> Self {
        Self {
            data,
            inner,
            _saga: PhantomData,
        }
    }
}

impl<G: EventSourcedSaga, S: MessageSender> MessageSender for EventApplyingSender<'_, G, S> {
    fn send(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.message().is_event() {
            let event: G::Event = envelope.message().decode()?;
            G::apply_event(self.data, event);
        }
        self.inner.send(envelope)
    }
}

/// Wrap a message produced by saga logic as a child of the inbound envelope.
pub(crate) fn child_envelope(inbound: &Envelope, outgoing: Outgoing) -> Envelope {
    let envelope = inbound.new_child(outgoing.message);
    match outgoing.delay {
        Some(delay) => envelope.with_delay(delay),
        None => envelope,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::envelope::{Message, MessageKind};

    fn envelope(kind: MessageKind, message_type: &str) -> Envelope {
        Envelope::new(Message::from_parts(kind, message_type, Value::Null))
    }

    #[test]
    fn recording_sender_keeps_events_and_forwards_everything() {
        let mut sender = RecordingSender::new(Outbound::new());
        sender.send(envelope(MessageKind::Command, "Ship")).unwrap();
        sender.send(envelope(MessageKind::Event, "Shipped")).unwrap();

        let recorded: Vec<_> = sender
            .recorded()
            .iter()
            .map(|e| e.message().message_type().to_owned())
            .collect();
        assert_eq!(recorded, ["Shipped"]);
        assert_eq!(sender.inner().envelopes().len(), 2);

        assert_eq!(sender.take_recorded().len(), 1);
        assert!(sender.recorded().is_empty());
        assert_eq!(sender.into_inner().envelopes().len(), 2);
    }

    #[test]
    fn delayed_outgoing_is_scheduled() {
        let inbound = envelope(MessageKind::Command, "Start");
        let child = child_envelope(
            &inbound,
            Outgoing {
                message: Message::from_parts(MessageKind::Command, "Remind", Value::Null),
                delay: Some(Duration::from_secs(60)),
            },
        );

        assert_eq!(child.causation_id(), inbound.message_id());
        assert_eq!(child.send_at(), child.created_at() + Duration::from_secs(60));
    }
}

//! Outbox record types.

use time::OffsetDateTime;

use crate::envelope::{Envelope, MessageId};

/// A claimed outbox message, ready for delivery.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    /// The message to deliver. Its message ID identifies the outbox row.
    pub envelope: Envelope,
    /// The inbound message whose handling produced this one.
    pub causation_id: MessageId,
    /// Number of previous delivery attempts (0 for first try).
    pub attempts: u32,
    /// When the message was written to the outbox.
    pub created_at: OffsetDateTime,
}

/// An outbox message that exceeded the maximum delivery attempts.
///
/// Dead letters remain in the outbox for inspection and manual retry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub causation_id: MessageId,
    /// Number of failed attempts.
    pub attempts: u32,
    /// The error message from the most recent failure.
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Query parameters for fetching dead letters.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Filter by message type.
    pub message_type: Option<String>,
    /// Filter by the inbound message that produced the dead letter.
    pub causation_id: Option<MessageId>,
    /// Maximum number of results to return (default 100).
    pub limit: Option<u32>,
}

impl DeadLetterQuery {
    /// Create a new empty query (matches all dead letters).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by message type.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Filter by causation.
    pub fn causation_id(mut self, causation_id: MessageId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(100)
    }

    pub(crate) fn matches(&self, envelope: &Envelope, causation_id: MessageId) -> bool {
        self.message_type
            .as_deref()
            .is_none_or(|t| t == envelope.message().message_type())
            && self.causation_id.is_none_or(|c| c == causation_id)
    }
}

//! Internal message type for the hub.

use relay_protocol::ChatMessage;
use relay_transport::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique message identifier.
pub type MessageId = u64;

/// Counter backing [`generate_message_id`].
static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A chat message travelling through the hub.
///
/// Immutable once built. The sender and content are what the client sent;
/// the id and source are routing metadata and never go back on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    source: Option<ConnectionId>,
    sender: String,
    content: String,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            source: None,
            sender: sender.into(),
            content: content.into(),
        }
    }

    /// Unique message identifier.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Connection the message arrived on, if it came from one.
    #[must_use]
    pub fn source(&self) -> Option<&ConnectionId> {
        self.source.as_ref()
    }

    /// Sender identity as claimed by the client.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Message body.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Record the connection the message arrived on.
    #[must_use]
    pub fn with_source(mut self, source: ConnectionId) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether the message arrived on the given connection.
    #[must_use]
    pub fn is_from(&self, connection: &ConnectionId) -> bool {
        self.source.as_ref() == Some(connection)
    }

    /// The wire form of this message.
    #[must_use]
    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage::new(self.sender.clone(), self.content.clone())
    }
}

impl From<ChatMessage> for Message {
    fn from(wire: ChatMessage) -> Self {
        Self::new(wire.username, wire.content)
    }
}

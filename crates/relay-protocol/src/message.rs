//! The chat message carried by every frame.

use serde::{Deserialize, Serialize};

/// A chat message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name chosen by the sending client.
    pub username: String,
    /// Message body.
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message.
    #[must_use]
    pub fn new(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
        }
    }
}

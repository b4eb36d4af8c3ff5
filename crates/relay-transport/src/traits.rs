//! Transport abstraction traits for the relay hub.
//!
//! These traits define what the hub needs from a client connection, keeping
//! the read loop, writer and dispatch loop independent of the wire transport.

use async_trait::async_trait;
use relay_protocol::{codec, ChatMessage, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Counter backing [`ConnectionId::generate`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer sent a payload that is not a valid message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Short label for the `kind` field of log events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "closed",
            Self::SendFailed(_) => "send",
            Self::ReceiveFailed(_) => "receive",
            Self::Protocol(_) => "decode",
        }
    }
}

/// The receiving half of a connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next message from the peer.
    ///
    /// Returns `Ok(None)` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError>;
}

/// The sending half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Send a pre-encoded frame.
    ///
    /// Used by the hub to encode a broadcast once for every recipient.
    async fn send_raw(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Encode and send a message.
    async fn send(&mut self, message: &ChatMessage) -> Result<(), TransportError> {
        let frame = codec::encode(message)?;
        self.send_raw(&frame).await
    }

    /// Close the connection. Calling this more than once is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An accepted client connection, ready to be split between a reader and a
/// writer.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split the connection into its receiving and sending halves.
    fn split(self: Box<Self>) -> (Box<dyn MessageStream>, Box<dyn MessageSink>);
}

//! In-process transport.
//!
//! [`pair`] returns a hub-side [`MemoryConnection`] and the [`MemoryClient`]
//! that plays the remote peer. Frames cross the pair as JSON text, exactly as
//! they would over a WebSocket, so decode failures behave the same way.
//!
//! Frames towards the client go through a bounded queue. A client that stops
//! calling [`MemoryClient::recv`] therefore stalls the hub's writer once the
//! queue is full, which is how slow consumers are simulated.

use async_trait::async_trait;
use relay_protocol::{codec, ChatMessage};
use tokio::sync::mpsc;
use tracing::warn;

use crate::traits::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};

/// Default number of frames buffered towards the client.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

/// Create a connected pair with the default client buffer.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryClient) {
    pair_with_buffer(DEFAULT_CLIENT_BUFFER)
}

/// Create a connected pair buffering at most `buffer` frames towards the client.
#[must_use]
pub fn pair_with_buffer(buffer: usize) -> (MemoryConnection, MemoryClient) {
    let id = ConnectionId::generate();
    let (client_tx, hub_rx) = mpsc::unbounded_channel();
    let (hub_tx, client_rx) = mpsc::channel(buffer.max(1));

    let connection = MemoryConnection {
        id: id.clone(),
        rx: hub_rx,
        tx: hub_tx,
    };
    let client = MemoryClient {
        id,
        tx: Some(client_tx),
        rx: client_rx,
    };
    (connection, client)
}

/// Hub side of an in-memory pair.
pub struct MemoryConnection {
    id: ConnectionId,
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::Sender<String>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageStream>, Box<dyn MessageSink>) {
        let this = *self;
        (
            Box::new(MemoryReader { rx: this.rx }),
            Box::new(MemoryWriter { tx: Some(this.tx) }),
        )
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl MessageStream for MemoryReader {
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        match self.rx.recv().await {
            Some(text) => Ok(Some(codec::decode(text.as_bytes())?)),
            None => Ok(None),
        }
    }
}

struct MemoryWriter {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl MessageSink for MemoryWriter {
    async fn send_raw(&mut self, frame: &str) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.to_owned())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Remote end of an in-memory pair.
///
/// Dropping the client closes the transport from the peer's side.
pub struct MemoryClient {
    id: ConnectionId,
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::Receiver<String>,
}

impl MemoryClient {
    /// ID of the hub-side connection this client is paired with.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Send a message to the hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub stopped reading from this connection.
    pub fn send(&self, message: &ChatMessage) -> Result<(), TransportError> {
        let frame = codec::encode(message)?;
        self.send_text(frame)
    }

    /// Send an arbitrary text frame, valid or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub stopped reading from this connection.
    pub fn send_text(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.into())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next message from the hub.
    ///
    /// Returns `None` once the hub has closed the connection and every
    /// buffered frame has been read.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        while let Some(frame) = self.rx.recv().await {
            match codec::decode(frame.as_bytes()) {
                Ok(message) => return Some(message),
                Err(e) => warn!(connection = %self.id, error = %e, "Skipping invalid frame"),
            }
        }
        None
    }

    /// Take the next raw frame from the hub without waiting.
    pub fn try_recv_raw(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Stop sending; the hub sees a clean close on its read side.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

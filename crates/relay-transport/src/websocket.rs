//! WebSocket transport implementation.
//!
//! Wraps a socket that axum has already upgraded. The handshake itself is
//! performed by axum's `WebSocketUpgrade` extractor in the server.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, ChatMessage};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};

/// Default maximum inbound message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Record the peer address, when the server knows it.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Reject inbound messages larger than `max` bytes.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageStream>, Box<dyn MessageSink>) {
        let this = *self;
        let (sink, stream) = this.socket.split();
        let reader = WebSocketReader {
            id: this.id.clone(),
            stream,
            max_message_size: this.max_message_size,
        };
        let writer = WebSocketWriter {
            id: this.id,
            sink,
            closed: false,
        };
        (Box::new(reader), Box::new(writer))
    }
}

/// Receiving half of a [`WebSocketConnection`].
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

#[async_trait]
impl MessageStream for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let message = codec::decode_with_limit(text.as_bytes(), self.max_message_size)?;
                    return Ok(Some(message));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Accept JSON sent in binary frames as well
                    let message = codec::decode_with_limit(&data, self.max_message_size)?;
                    return Ok(Some(message));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pings are answered by the socket itself
                    trace!(connection = %self.id, "Control frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection = %self.id, ?frame, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Sending half of a [`WebSocketConnection`].
pub struct WebSocketWriter {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl MessageSink for WebSocketWriter {
    async fn send_raw(&mut self, frame: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(Message::Text(frame.to_owned()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            // The peer may already be gone
            debug!(connection = %self.id, error = %e, "Close frame not delivered");
            return Err(TransportError::SendFailed(e.to_string()));
        }
        if let Err(e) = self.sink.close().await {
            debug!(connection = %self.id, error = %e, "WebSocket close after close frame");
        }
        Ok(())
    }
}

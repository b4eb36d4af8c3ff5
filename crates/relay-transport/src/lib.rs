//! # relay-transport
//!
//! Transport abstraction layer for the relay chat hub.
//!
//! A [`Connection`] is one client's duplex channel. The hub splits it into a
//! [`MessageStream`] owned by the connection's read loop and a [`MessageSink`]
//! owned by its writer, so reads and writes never contend for the same lock.
//!
//! - **WebSocket** - axum's upgraded socket (feature `websocket`, default)
//! - **Memory** - in-process pairs for tests and benchmarks
//!
//! ```rust,ignore
//! use relay_transport::Connection;
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut stream, mut sink) = conn.split();
//!     while let Ok(Some(message)) = stream.recv().await {
//!         if sink.send(&message).await.is_err() {
//!             break;
//!         }
//!     }
//!     let _ = sink.close().await;
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

//! # relay-core
//!
//! The connection hub of the relay chat server.
//!
//! - **Message** - a chat message plus routing metadata
//! - **Registry** - the set of live connections
//! - **Hub** - accepts connections and runs one read loop and one writer each
//! - **Dispatcher** - the single loop that fans every message out
//!
//! ## Architecture
//!
//! ```text
//!  read loop ─┐                         ┌─▶ outbound buffer ─▶ writer ─▶ client
//!  read loop ─┼─▶ inbound ─▶ Dispatcher ┼─▶ outbound buffer ─▶ writer ─▶ client
//!  read loop ─┘    queue         │      └─▶ outbound buffer ─▶ writer ─▶ client
//!                                ▼
//!                             Registry
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_core::{Hub, HubConfig};
//!
//! let (hub, dispatch) = Hub::start(HubConfig::default());
//! let id = hub.accept(Box::new(connection))?;
//! // ...
//! hub.shutdown();
//! dispatch.await?;
//! ```

pub mod dispatch;
pub mod hub;
pub mod message;
pub mod registry;

pub use dispatch::Dispatcher;
pub use hub::{CloseReason, Hub, HubConfig, HubError, HubStats, OverflowPolicy};
pub use message::Message;
pub use registry::{ConnectionHandle, DeliveryError, Registry};
pub use relay_transport::ConnectionId;

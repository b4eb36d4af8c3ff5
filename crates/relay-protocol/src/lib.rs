//! # relay-protocol
//!
//! Wire protocol definitions for the relay chat hub.
//!
//! Every frame exchanged with a client, in both directions, is a single JSON
//! object carrying a chat message:
//!
//! ```json
//! { "username": "alice", "content": "hello" }
//! ```
//!
//! Unknown fields are ignored. Both fields are required; a frame missing
//! either one fails to decode.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ChatMessage};
//!
//! let message = ChatMessage::new("alice", "hello");
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(encoded.as_bytes()).unwrap();
//! assert_eq!(decoded, message);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use message::ChatMessage;

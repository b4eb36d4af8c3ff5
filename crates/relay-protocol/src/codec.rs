//! Codec for encoding and decoding chat messages.
//!
//! Messages travel as UTF-8 JSON text, one message per WebSocket frame, so no
//! additional framing is applied here.

use thiserror::Error;

use crate::message::ChatMessage;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the allowed size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Limit that was applied.
        max: usize,
    },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(serde_json::Error),

    /// JSON decoding error, including missing required fields.
    #[error("Decoding error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the error was caused by bytes received from a peer, as opposed
    /// to a failure on the hub's own side.
    #[must_use]
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::FrameTooLarge { .. })
    }
}

/// Encode a message to its JSON text form.
///
/// # Errors
///
/// Returns an error if the encoded message is too large or encoding fails.
pub fn encode(message: &ChatMessage) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message).map_err(ProtocolError::Encode)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(text)
}

/// Decode a message from a frame payload.
///
/// # Errors
///
/// Returns an error if the payload is larger than [`MAX_FRAME_SIZE`] or is not
/// a valid message.
pub fn decode(data: &[u8]) -> Result<ChatMessage, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode a message from a frame payload, rejecting payloads over `max_size`.
///
/// # Errors
///
/// Returns an error if the payload is too large or is not a valid message.
pub fn decode_with_limit(data: &[u8], max_size: usize) -> Result<ChatMessage, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    let message = serde_json::from_slice(data)?;
    Ok(message)
}

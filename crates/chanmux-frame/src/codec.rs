use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Channel prefix: one byte in both protocols.
pub const PREFIX_SIZE: usize = 1;

/// A decoded message with its channel index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The channel this message belongs to.
    pub channel: u8,
    /// The message payload (decoded, for base64).
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    pub fn new(channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

/// Returns true if a fragment is a heartbeat.
///
/// A final fragment of at most one byte carries no payload and is ignored.
/// Non-final fragments are never heartbeats, whatever their length.
pub fn is_heartbeat(count: usize, end_of_message: bool) -> bool {
    end_of_message && count <= PREFIX_SIZE
}

/// Encode a `channel.k8s.io` message.
///
/// Wire format:
/// ```text
/// ┌───────────────┬─────────────────────┐
/// │ Channel (1B)  │ Payload             │
/// └───────────────┴─────────────────────┘
/// ```
pub fn encode_message(channel: u8, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(PREFIX_SIZE + payload.len());
    dst.put_u8(channel);
    dst.put_slice(payload);
}

/// Encode a `base64.channel.k8s.io` message.
///
/// The channel is written as one ASCII digit, so only indexes 0-9 can be
/// encoded.
pub fn encode_base64_message(channel: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if channel > 9 {
        return Err(FrameError::ChannelNotEncodable(channel));
    }
    let encoded = STANDARD.encode(payload);
    dst.reserve(PREFIX_SIZE + encoded.len());
    dst.put_u8(b'0' + channel);
    dst.put_slice(encoded.as_bytes());
    Ok(())
}

/// Decode a complete `channel.k8s.io` message.
pub fn decode_message(message: &[u8]) -> Result<Message> {
    let (&channel, payload) = message.split_first().ok_or(FrameError::EmptyMessage)?;
    Ok(Message::new(channel, Bytes::copy_from_slice(payload)))
}

/// Decode a complete `base64.channel.k8s.io` message.
pub fn decode_base64_message(message: &[u8]) -> Result<Message> {
    let (&digit, payload) = message.split_first().ok_or(FrameError::EmptyMessage)?;
    if !digit.is_ascii_digit() {
        return Err(FrameError::InvalidChannelDigit(digit));
    }
    let decoded = STANDARD.decode(payload)?;
    Ok(Message::new(digit - b'0', decoded))
}

//! Sub-protocol names and per-protocol framing.

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;
use chanmux_transport::MessageKind;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Message};
use crate::error::{FrameError, Result};

/// Sub-protocol name of the binary channel protocol.
pub const CHANNEL_V1: &str = "channel.k8s.io";

/// Sub-protocol name of the base64 text channel protocol.
pub const BASE64_CHANNEL_V1: &str = "base64.channel.k8s.io";

/// Wire protocol spoken on a multiplexed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelProtocol {
    /// Raw channel byte followed by the payload, binary messages.
    #[default]
    #[serde(rename = "channel.k8s.io")]
    V1,
    /// ASCII digit channel followed by the base64 payload, text messages.
    #[serde(rename = "base64.channel.k8s.io")]
    Base64V1,
}

impl ChannelProtocol {
    /// The sub-protocol name negotiated during the connection upgrade.
    pub fn subprotocol(self) -> &'static str {
        match self {
            ChannelProtocol::V1 => CHANNEL_V1,
            ChannelProtocol::Base64V1 => BASE64_CHANNEL_V1,
        }
    }

    /// Look up a protocol by its negotiated sub-protocol name.
    pub fn from_subprotocol(name: &str) -> Result<Self> {
        match name {
            CHANNEL_V1 => Ok(ChannelProtocol::V1),
            BASE64_CHANNEL_V1 => Ok(ChannelProtocol::Base64V1),
            other => Err(FrameError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// Transport message type used for data messages.
    pub fn message_kind(self) -> MessageKind {
        match self {
            ChannelProtocol::V1 => MessageKind::Binary,
            ChannelProtocol::Base64V1 => MessageKind::Text,
        }
    }

    /// Check that `index` can be written in this protocol's prefix.
    pub fn check_index(self, index: u8) -> Result<()> {
        match self {
            ChannelProtocol::V1 => Ok(()),
            ChannelProtocol::Base64V1 if index <= 9 => Ok(()),
            ChannelProtocol::Base64V1 => Err(FrameError::ChannelNotEncodable(index)),
        }
    }

    /// Append one framed message to `dst`.
    pub fn encode(self, index: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        match self {
            ChannelProtocol::V1 => {
                codec::encode_message(index, payload, dst);
                Ok(())
            }
            ChannelProtocol::Base64V1 => codec::encode_base64_message(index, payload, dst),
        }
    }

    /// Decode one complete message.
    pub fn decode(self, message: &[u8]) -> Result<Message> {
        match self {
            ChannelProtocol::V1 => codec::decode_message(message),
            ChannelProtocol::Base64V1 => codec::decode_base64_message(message),
        }
    }
}

impl fmt::Display for ChannelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

impl FromStr for ChannelProtocol {
    type Err = FrameError;

    /// Accepts the full sub-protocol names and the short forms `v1` / `base64`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1" => Ok(ChannelProtocol::V1),
            "base64" => Ok(ChannelProtocol::Base64V1),
            other => ChannelProtocol::from_subprotocol(other),
        }
    }
}

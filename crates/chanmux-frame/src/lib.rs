//! Message framing for the `channel.k8s.io` sub-protocol family.
//!
//! Every data message on the connection starts with a channel index:
//! - `channel.k8s.io`: one raw byte, then the payload (binary message)
//! - `base64.channel.k8s.io`: one ASCII digit, then the base64 payload
//!   (text message)
//!
//! A final fragment of at most one byte is a heartbeat and carries no data.

pub mod channel;
pub mod codec;
pub mod error;
pub mod protocol;

pub use channel::{
    exec_channel_name, port_forward_channel_name, PORT_FORWARD_DATA, PORT_FORWARD_ERROR, STDERR,
    STDIN, STDOUT,
};
pub use codec::{
    decode_base64_message, decode_message, encode_base64_message, encode_message, is_heartbeat,
    Message, PREFIX_SIZE,
};
pub use error::{FrameError, Result};
pub use protocol::{ChannelProtocol, BASE64_CHANNEL_V1, CHANNEL_V1};

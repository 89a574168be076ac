/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The message has no channel prefix.
    #[error("empty message (missing channel prefix)")]
    EmptyMessage,

    /// A base64 message started with something other than an ASCII digit.
    #[error("invalid channel digit 0x{0:02x}")]
    InvalidChannelDigit(u8),

    /// The channel index cannot be written in the base64 protocol prefix.
    #[error("channel {0} cannot be encoded as a single ASCII digit")]
    ChannelNotEncodable(u8),

    /// The payload of a base64 message is not valid base64.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The sub-protocol name is not one this crate speaks.
    #[error("unsupported sub-protocol: {0}")]
    UnsupportedProtocol(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;

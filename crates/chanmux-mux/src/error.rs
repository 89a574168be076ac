use chanmux_frame::ChannelProtocol;

/// Errors that can occur in multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Neither inbound nor outbound channels were declared.
    #[error("at least one inbound or outbound channel is required")]
    NoChannels,

    /// `start` was called more than once.
    #[error("multiplexer already started")]
    AlreadyStarted,

    /// The operation needs running pumps.
    #[error("multiplexer not started")]
    NotStarted,

    /// `start` was called outside a Tokio runtime.
    #[error("no Tokio runtime available to run the pumps")]
    NoRuntime,

    /// The multiplexer is shutting down or stopped.
    #[error("multiplexer stopped")]
    Stopped,

    /// A declared channel index cannot be written in the chosen protocol.
    #[error("channel {index} cannot be encoded with {protocol}")]
    ChannelNotEncodable { index: u8, protocol: ChannelProtocol },

    /// The write was cancelled before it was transmitted.
    #[error("write cancelled")]
    Cancelled,

    /// The write was dropped unsent because the send pump stopped.
    #[error("write aborted (send pump stopped)")]
    Aborted,

    /// The receive pump failed; no more data will arrive on this channel.
    #[error("channel {0} aborted after a receive failure")]
    ChannelAborted(u8),

    /// The channel buffered more unread data than allowed.
    #[error("channel {index} exceeded {max} pending bytes")]
    CapacityExceeded { index: u8, max: usize },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] chanmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] chanmux_frame::FrameError),
}

impl MuxError {
    /// Returns true if the error reports a peer that vanished mid-session.
    pub fn is_premature_close(&self) -> bool {
        matches!(self, MuxError::Transport(err) if err.is_premature_close())
    }
}

impl From<MuxError> for std::io::Error {
    fn from(err: MuxError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            MuxError::NotStarted => ErrorKind::NotConnected,
            MuxError::Stopped => ErrorKind::BrokenPipe,
            MuxError::Cancelled => ErrorKind::Interrupted,
            MuxError::Aborted | MuxError::ChannelAborted(_) => ErrorKind::ConnectionAborted,
            MuxError::Transport(chanmux_transport::TransportError::Io(io)) => io.kind(),
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Errors that can occur on a duplex connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote end went away without completing the close handshake.
    #[error("connection closed prematurely")]
    ConnectionClosedPrematurely,

    /// The connection is closed (or closing) and can no longer carry messages.
    #[error("connection closed")]
    Closed,

    /// The operation observed cancellation before it completed.
    #[error("transport operation cancelled")]
    Cancelled,

    /// An I/O error occurred on the underlying connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end violated the message protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true if this error means the peer vanished mid-session.
    ///
    /// Both an explicit premature close and the common I/O flavours of a
    /// dropped connection count.
    pub fn is_premature_close(&self) -> bool {
        match self {
            TransportError::ConnectionClosedPrematurely => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

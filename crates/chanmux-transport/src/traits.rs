use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Close status code for a normal, orderly closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// The type of a transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
    Text,
    /// Close handshake message; carries a [`CloseStatus`].
    Close,
}

/// Status carried by a close handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
}

impl CloseStatus {
    /// Create a close status.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The status sent when the local side shuts a session down.
    pub fn normal() -> Self {
        Self::new(NORMAL_CLOSURE, "Connection closed.")
    }
}

/// Result of receiving one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Number of bytes written into the caller's buffer.
    pub count: usize,
    /// Type of the message this fragment belongs to.
    pub kind: MessageKind,
    /// True if this is the final fragment of the message.
    pub end_of_message: bool,
    /// Close status, present when `kind` is [`MessageKind::Close`].
    pub close_status: Option<CloseStatus>,
}

impl ReceiveResult {
    /// A data fragment.
    pub fn data(count: usize, kind: MessageKind, end_of_message: bool) -> Self {
        Self {
            count,
            kind,
            end_of_message,
            close_status: None,
        }
    }

    /// A close handshake message.
    pub fn close(status: CloseStatus) -> Self {
        Self {
            count: 0,
            kind: MessageKind::Close,
            end_of_message: true,
            close_status: Some(status),
        }
    }

    pub fn is_close(&self) -> bool {
        self.kind == MessageKind::Close
    }
}

/// Observable state of a duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    /// Local side sent a close message and awaits the reply.
    CloseSent = 1,
    /// Remote side sent a close message; the reply has not been sent.
    CloseReceived = 2,
    Closed = 3,
    /// The connection failed or the remote end vanished.
    Aborted = 4,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    /// True if the local side still owes the remote side a close message.
    pub fn awaits_local_close(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::CloseReceived)
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::CloseSent,
            2 => ConnectionState::CloseReceived,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Aborted,
        }
    }
}

/// Receiving half of a duplex connection.
///
/// `receive` must be cancel safe: dropping the returned future before it
/// completes must not lose any part of a fragment.
pub trait FragmentSource: Send + 'static {
    /// Receive the next fragment into `buf`.
    ///
    /// Fragments larger than `buf` are delivered over several calls, with
    /// `end_of_message` set only on the last one.
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Result<ReceiveResult>> + Send + 'a;

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}

/// Sending half of a duplex connection.
pub trait MessageSink: Send + 'static {
    /// Transmit `message` as one complete message.
    ///
    /// Implementations check `cancel` only at points where stopping leaves
    /// the connection consistent; a partially written message is never
    /// abandoned.
    fn send<'a>(
        &'a mut self,
        message: &'a [u8],
        kind: MessageKind,
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Send a close message (first or second half of the close handshake).
    fn close(&mut self, status: CloseStatus) -> impl Future<Output = Result<()>> + Send + '_;

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}

/// An already-open, message-oriented duplex connection.
pub trait DuplexConnection: Send + 'static {
    type Source: FragmentSource;
    type Sink: MessageSink;

    /// Split into independently owned receive and send halves.
    fn split(self) -> (Self::Source, Self::Sink);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_u8() {
        for state in [
            ConnectionState::Open,
            ConnectionState::CloseSent,
            ConnectionState::CloseReceived,
            ConnectionState::Closed,
            ConnectionState::Aborted,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn local_close_owed_only_while_open_or_remote_closing() {
        assert!(ConnectionState::Open.awaits_local_close());
        assert!(ConnectionState::CloseReceived.awaits_local_close());
        assert!(!ConnectionState::CloseSent.awaits_local_close());
        assert!(!ConnectionState::Closed.awaits_local_close());
        assert!(!ConnectionState::Aborted.awaits_local_close());
    }

    #[test]
    fn close_result_is_final() {
        let result = ReceiveResult::close(CloseStatus::normal());
        assert!(result.is_close());
        assert!(result.end_of_message);
        assert_eq!(result.close_status.map(|s| s.code), Some(NORMAL_CLOSURE));
    }
}

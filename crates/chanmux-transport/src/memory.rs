//! In-process duplex transport.
//!
//! [`duplex`] returns a [`MemoryConnection`] for the multiplexer side and a
//! [`MemoryPeer`] that plays the remote end: it injects fragments and close
//! messages, and observes every message the connection transmits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{
    CloseStatus, ConnectionState, DuplexConnection, FragmentSource, MessageKind, MessageSink,
    ReceiveResult,
};

/// Configuration for the memory transport.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Deliver inbound messages in fragments of at most this many bytes.
    pub max_fragment_size: Option<usize>,
    /// Delay applied to every transmitted message (simulates a slow link).
    pub send_delay: Option<Duration>,
}

/// Something the connection transmitted, as seen by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Message { kind: MessageKind, data: Bytes },
    Close(CloseStatus),
}

impl PeerEvent {
    /// Payload of a data message, `None` for a close.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            PeerEvent::Message { data, .. } => Some(data.as_ref()),
            PeerEvent::Close(_) => None,
        }
    }
}

enum Inbound {
    Fragment {
        data: Bytes,
        kind: MessageKind,
        end_of_message: bool,
    },
    Close(CloseStatus),
}

struct Partial {
    data: Bytes,
    kind: MessageKind,
    end_of_message: bool,
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn on_remote_close(&self) {
        if !self.transition(ConnectionState::Open, ConnectionState::CloseReceived) {
            self.transition(ConnectionState::CloseSent, ConnectionState::Closed);
        }
    }

    fn on_local_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::CloseSent)
            || self.transition(ConnectionState::CloseReceived, ConnectionState::Closed)
    }
}

/// Create a connected memory connection / peer pair.
pub fn duplex(config: MemoryConfig) -> (MemoryConnection, MemoryPeer) {
    let state = Arc::new(SharedState(AtomicU8::new(ConnectionState::Open as u8)));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let connection = MemoryConnection {
        source: MemorySource {
            rx: inbound_rx,
            partial: None,
            max_fragment_size: config.max_fragment_size,
            state: Arc::clone(&state),
        },
        sink: MemorySink {
            tx: outbound_tx,
            send_delay: config.send_delay,
            state: Arc::clone(&state),
        },
    };
    let peer = MemoryPeer {
        tx: inbound_tx,
        rx: outbound_rx,
        state,
    };
    (connection, peer)
}

/// Multiplexer-side end of a memory duplex.
pub struct MemoryConnection {
    source: MemorySource,
    sink: MemorySink,
}

impl MemoryConnection {
    pub fn state(&self) -> ConnectionState {
        self.source.state.get()
    }
}

impl DuplexConnection for MemoryConnection {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn split(self) -> (MemorySource, MemorySink) {
        (self.source, self.sink)
    }
}

/// Receive half of a [`MemoryConnection`].
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
    partial: Option<Partial>,
    max_fragment_size: Option<usize>,
    state: Arc<SharedState>,
}

impl FragmentSource for MemorySource {
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl std::future::Future<Output = Result<ReceiveResult>> + Send + 'a {
        async move {
            let partial = match self.partial.take() {
                Some(partial) => partial,
                None => match self.rx.recv().await {
                    Some(Inbound::Fragment {
                        data,
                        kind,
                        end_of_message,
                    }) => Partial {
                        data,
                        kind,
                        end_of_message,
                    },
                    Some(Inbound::Close(status)) => {
                        self.state.on_remote_close();
                        debug!(code = status.code, "memory transport received close");
                        return Ok(ReceiveResult::close(status));
                    }
                    None => {
                        self.state.set(ConnectionState::Aborted);
                        return Err(TransportError::ConnectionClosedPrematurely);
                    }
                },
            };

            let limit = buf
                .len()
                .min(self.max_fragment_size.unwrap_or(usize::MAX))
                .max(1);
            if partial.data.len() > limit {
                buf[..limit].copy_from_slice(&partial.data[..limit]);
                self.partial = Some(Partial {
                    data: partial.data.slice(limit..),
                    kind: partial.kind,
                    end_of_message: partial.end_of_message,
                });
                return Ok(ReceiveResult::data(limit, partial.kind, false));
            }

            let count = partial.data.len();
            buf[..count].copy_from_slice(&partial.data);
            Ok(ReceiveResult::data(
                count,
                partial.kind,
                partial.end_of_message,
            ))
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Send half of a [`MemoryConnection`].
pub struct MemorySink {
    tx: mpsc::UnboundedSender<PeerEvent>,
    send_delay: Option<Duration>,
    state: Arc<SharedState>,
}

impl MessageSink for MemorySink {
    fn send<'a>(
        &'a mut self,
        message: &'a [u8],
        kind: MessageKind,
        cancel: &'a CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'a {
        async move {
            if !self.state.get().awaits_local_close() {
                return Err(TransportError::Closed);
            }

            if let Some(delay) = self.send_delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                }
            }

            let event = PeerEvent::Message {
                kind,
                data: Bytes::copy_from_slice(message),
            };
            self.tx.send(event).map_err(|_| {
                self.state.set(ConnectionState::Aborted);
                TransportError::ConnectionClosedPrematurely
            })?;
            trace!(len = message.len(), ?kind, "memory transport sent message");
            Ok(())
        }
    }

    fn close(
        &mut self,
        status: CloseStatus,
    ) -> impl std::future::Future<Output = Result<()>> + Send + '_ {
        async move {
            if !self.state.on_local_close() {
                debug!(state = ?self.state.get(), "memory transport close ignored");
                return Ok(());
            }
            debug!(code = status.code, "memory transport sent close");
            self.tx
                .send(PeerEvent::Close(status))
                .map_err(|_| TransportError::ConnectionClosedPrematurely)
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Remote end of a memory duplex.
///
/// Dropping the peer without calling [`MemoryPeer::close`] makes the
/// connection observe a premature close.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<PeerEvent>,
    state: Arc<SharedState>,
}

impl MemoryPeer {
    /// Inject one fragment.
    pub fn send_fragment(
        &self,
        data: impl Into<Bytes>,
        kind: MessageKind,
        end_of_message: bool,
    ) -> Result<()> {
        self.tx
            .send(Inbound::Fragment {
                data: data.into(),
                kind,
                end_of_message,
            })
            .map_err(|_| TransportError::Closed)
    }

    /// Inject a complete binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_fragment(data, MessageKind::Binary, true)
    }

    /// Inject a complete text message.
    pub fn send_text(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_fragment(data, MessageKind::Text, true)
    }

    /// Start (or answer) the close handshake from the remote side.
    pub fn close(&self, status: CloseStatus) -> Result<()> {
        self.tx
            .send(Inbound::Close(status))
            .map_err(|_| TransportError::Closed)
    }

    /// Wait for the next event transmitted by the connection.
    ///
    /// Returns `None` once the connection's send half is gone.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }

    /// Take the next transmitted event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }

    /// State of the connection as the multiplexer side sees it.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

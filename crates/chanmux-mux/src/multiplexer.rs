use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chanmux_frame::ChannelProtocol;
use chanmux_transport::{CloseStatus, DuplexConnection, MessageSink};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, debug_span, warn, Dispatch, Instrument};

use crate::buffer::{BufferPool, PoolStats};
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::inbound::InboundStream;
use crate::outbound::{OutboundStream, SendQueue};
use crate::pending::PendingWrite;
use crate::pump::{ReceivePump, SendPump};
use crate::state::{Lifecycle, MuxState};

/// Smallest usable receive buffer: channel prefix plus one payload byte.
const MIN_BUFFER_SIZE: usize = 2;

/// Parts handed to the pumps by `start`.
struct Startup<S> {
    source: S,
    queue: mpsc::UnboundedReceiver<PendingWrite>,
}

/// Carries several ordered byte streams over one duplex connection.
///
/// Inbound and outbound channel indexes are fixed at construction. After
/// [`start`](Self::start), a receive pump routes each incoming message to
/// the [`InboundStream`] for its channel index, and a send pump transmits
/// [`OutboundStream`] writes one message at a time in enqueue order.
///
/// Await [`shutdown`](Self::shutdown) before dropping a started
/// multiplexer. Dropping it stops the pumps and ends the inbound streams,
/// but sends no close message, so the peer sees the connection vanish
/// instead of a normal-closure handshake.
///
/// ```no_run
/// # async fn demo() -> chanmux_mux::Result<()> {
/// use chanmux_frame::{STDERR, STDIN, STDOUT};
/// use chanmux_mux::Multiplexer;
/// use chanmux_transport::{duplex, MemoryConfig};
///
/// let (connection, _peer) = duplex(MemoryConfig::default());
/// let mux = Multiplexer::new(connection, [STDOUT, STDERR], [STDIN])?;
/// mux.start()?;
///
/// let stdin = mux.outbound_stream(STDIN).expect("declared");
/// stdin.write(b"ls\n").await?;
/// mux.shutdown_default().await
/// # }
/// ```
pub struct Multiplexer<C: DuplexConnection> {
    inbound: Arc<HashMap<u8, InboundStream>>,
    outbound: HashMap<u8, OutboundStream>,
    lifecycle: Arc<Lifecycle>,
    pool: BufferPool,
    buffer_size: usize,
    protocol: ChannelProtocol,
    shutdown_grace: Duration,
    dispatch: Dispatch,
    cancel: CancellationToken,
    closed: CancellationToken,
    remote_close: Arc<StdMutex<Option<CloseStatus>>>,
    sink: Arc<Mutex<C::Sink>>,
    startup: StdMutex<Option<Startup<C::Source>>>,
    pumps: StdMutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl<C: DuplexConnection> Multiplexer<C> {
    /// Create a multiplexer with the default configuration.
    pub fn new(
        connection: C,
        inbound: impl IntoIterator<Item = u8>,
        outbound: impl IntoIterator<Item = u8>,
    ) -> Result<Self> {
        Self::with_config(connection, inbound, outbound, MuxConfig::default())
    }

    /// Create a multiplexer.
    ///
    /// Fails with [`MuxError::NoChannels`] when both index sets are empty,
    /// and with [`MuxError::ChannelNotEncodable`] when an index cannot be
    /// written in the configured protocol.
    pub fn with_config(
        connection: C,
        inbound: impl IntoIterator<Item = u8>,
        outbound: impl IntoIterator<Item = u8>,
        config: MuxConfig,
    ) -> Result<Self> {
        let inbound: Vec<u8> = inbound.into_iter().collect();
        let outbound: Vec<u8> = outbound.into_iter().collect();
        if inbound.is_empty() && outbound.is_empty() {
            return Err(MuxError::NoChannels);
        }
        let protocol = config.protocol;
        for &index in inbound.iter().chain(&outbound) {
            protocol
                .check_index(index)
                .map_err(|_| MuxError::ChannelNotEncodable { index, protocol })?;
        }

        let dispatch = config
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));
        let lifecycle = Arc::new(Lifecycle::new());
        let pool = BufferPool::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(SendQueue::new(
            tx,
            Arc::clone(&lifecycle),
            pool.clone(),
            protocol,
        ));

        let inbound_streams: HashMap<u8, InboundStream> = inbound
            .iter()
            .map(|&index| {
                let stream =
                    InboundStream::new(index, config.max_pending_bytes, Arc::clone(&lifecycle));
                (index, stream)
            })
            .collect();
        let outbound_streams: HashMap<u8, OutboundStream> = outbound
            .iter()
            .map(|&index| (index, OutboundStream::new(index, Arc::clone(&queue))))
            .collect();

        let (source, sink) = connection.split();

        tracing::dispatcher::with_default(&dispatch, || {
            debug!(
                inbound = ?sorted(inbound_streams.keys()),
                outbound = ?sorted(outbound_streams.keys()),
                %protocol,
                "multiplexer created"
            );
        });

        Ok(Self {
            inbound: Arc::new(inbound_streams),
            outbound: outbound_streams,
            lifecycle,
            pool,
            buffer_size: config.buffer_size.max(MIN_BUFFER_SIZE),
            protocol,
            shutdown_grace: config.shutdown_grace,
            dispatch,
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            remote_close: Arc::new(StdMutex::new(None)),
            sink: Arc::new(Mutex::new(sink)),
            startup: StdMutex::new(Some(Startup { source, queue: rx })),
            pumps: StdMutex::new(None),
        })
    }

    /// Spawn the receive and send pumps on the current Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MuxError::NoRuntime)?;
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Startup { source, queue }) = startup else {
            return Err(self.start_refusal());
        };
        if !self.lifecycle.transition(MuxState::Created, MuxState::Running) {
            return Err(self.start_refusal());
        }

        let (receive_span, send_span) = tracing::dispatcher::with_default(&self.dispatch, || {
            (debug_span!("receive_pump"), debug_span!("send_pump"))
        });

        let receive = ReceivePump {
            source,
            sink: Arc::clone(&self.sink),
            inbound: Arc::clone(&self.inbound),
            pool: self.pool.clone(),
            buffer_size: self.buffer_size,
            protocol: self.protocol,
            cancel: self.cancel.clone(),
            closed: self.closed.clone(),
            remote_close: Arc::clone(&self.remote_close),
        };
        let send = SendPump {
            sink: Arc::clone(&self.sink),
            queue,
            cancel: self.cancel.clone(),
        };

        let receive = runtime.spawn(
            receive
                .run()
                .instrument(receive_span)
                .with_subscriber(self.dispatch.clone()),
        );
        let send = runtime.spawn(
            send.run()
                .instrument(send_span)
                .with_subscriber(self.dispatch.clone()),
        );
        *self.pumps.lock().unwrap_or_else(PoisonError::into_inner) = Some((receive, send));

        tracing::dispatcher::with_default(&self.dispatch, || debug!("multiplexer started"));
        Ok(())
    }

    fn start_refusal(&self) -> MuxError {
        match self.lifecycle.get() {
            MuxState::Stopped => MuxError::Stopped,
            _ => MuxError::AlreadyStarted,
        }
    }

    /// Stream for an inbound channel index; `None` if it was not declared.
    pub fn inbound_stream(&self, index: u8) -> Option<InboundStream> {
        self.inbound.get(&index).cloned()
    }

    /// Stream for an outbound channel index; `None` if it was not declared.
    pub fn outbound_stream(&self, index: u8) -> Option<OutboundStream> {
        self.outbound.get(&index).cloned()
    }

    /// Declared inbound indexes, ascending.
    pub fn inbound_indexes(&self) -> Vec<u8> {
        sorted(self.inbound.keys())
    }

    /// Declared outbound indexes, ascending.
    pub fn outbound_indexes(&self) -> Vec<u8> {
        sorted(self.outbound.keys())
    }

    pub fn state(&self) -> MuxState {
        self.lifecycle.get()
    }

    pub fn protocol(&self) -> ChannelProtocol {
        self.protocol
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close status sent by the peer, if it initiated the close handshake.
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.remote_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True once the connection has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the connection has been closed by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// [`shutdown`](Self::shutdown) with the configured grace period.
    pub async fn shutdown_default(&self) -> Result<()> {
        self.shutdown(self.shutdown_grace).await
    }

    /// Stop the pumps and close the connection.
    ///
    /// Waits up to `grace` for the pumps, then sends a normal-closure close
    /// message if the connection still expects one. Inbound streams end
    /// after their queued data; queued writes resolve as aborted. Later
    /// calls return at once.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.shutdown_inner(grace)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn shutdown_inner(&self, grace: Duration) -> Result<()> {
        match self.lifecycle.get() {
            MuxState::Created => {
                if self.lifecycle.transition(MuxState::Created, MuxState::Stopped) {
                    self.finish_streams();
                    self.closed.cancel();
                    debug!("multiplexer stopped before start");
                }
                return Ok(());
            }
            MuxState::Running => {}
            MuxState::Draining | MuxState::Stopped => return Ok(()),
        }
        if !self.lifecycle.transition(MuxState::Running, MuxState::Draining) {
            return Ok(());
        }

        debug!(grace_ms = grace.as_millis() as u64, "shutting down");
        self.cancel.cancel();

        let pumps = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((receive, send)) = pumps {
            let joined = tokio::time::timeout(grace, async {
                let _ = receive.await;
                let _ = send.await;
            })
            .await;
            if joined.is_err() {
                debug!("pumps still running after grace period");
            }
        }

        let result = match self.sink.try_lock() {
            Ok(mut sink) if sink.state().awaits_local_close() => {
                debug!("closing connection");
                sink.close(CloseStatus::normal())
                    .await
                    .map_err(MuxError::from)
            }
            Ok(sink) => {
                debug!(state = ?sink.state(), "connection already closed");
                Ok(())
            }
            Err(_) => {
                warn!("connection busy after grace period; skipping close handshake");
                Ok(())
            }
        };

        self.finish_streams();
        self.lifecycle.set(MuxState::Stopped);
        self.closed.cancel();
        debug!("multiplexer stopped");
        result
    }

    fn finish_streams(&self) {
        for stream in self.inbound.values() {
            stream.finish();
        }
    }
}

impl<C: DuplexConnection> fmt::Debug for Multiplexer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &self.state())
            .field("protocol", &self.protocol)
            .field("inbound", &self.inbound_indexes())
            .field("outbound", &self.outbound_indexes())
            .finish()
    }
}

impl<C: DuplexConnection> Drop for Multiplexer<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.lifecycle.get() != MuxState::Stopped {
            self.lifecycle.set(MuxState::Stopped);
            self.finish_streams();
        }
    }
}

fn sorted<'a>(indexes: impl Iterator<Item = &'a u8>) -> Vec<u8> {
    let mut indexes: Vec<u8> = indexes.copied().collect();
    indexes.sort_unstable();
    indexes
}

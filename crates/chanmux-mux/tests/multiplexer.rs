use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chanmux_frame::ChannelProtocol;
use chanmux_mux::{MuxConfig, MuxError, MuxState, Multiplexer};
use chanmux_transport::memory::{MemorySink, MemorySource};
use chanmux_transport::{
    duplex, CloseStatus, ConnectionState, DuplexConnection, FragmentSource, MemoryConfig,
    MemoryConnection, MemoryPeer, MessageKind, MessageSink, PeerEvent, ReceiveResult,
    TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const GRACE: Duration = Duration::from_millis(100);

fn setup(
    config: MuxConfig,
    memory: MemoryConfig,
    inbound: &[u8],
    outbound: &[u8],
) -> (Multiplexer<MemoryConnection>, MemoryPeer) {
    let (connection, peer) = duplex(memory);
    let mux = Multiplexer::with_config(
        connection,
        inbound.iter().copied(),
        outbound.iter().copied(),
        config,
    )
    .unwrap();
    (mux, peer)
}

fn started(inbound: &[u8], outbound: &[u8]) -> (Multiplexer<MemoryConnection>, MemoryPeer) {
    let (mux, peer) = setup(
        MuxConfig::default(),
        MemoryConfig::default(),
        inbound,
        outbound,
    );
    mux.start().unwrap();
    (mux, peer)
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn binary(data: &[u8]) -> PeerEvent {
    PeerEvent::Message {
        kind: MessageKind::Binary,
        data: data.to_vec().into(),
    }
}

#[tokio::test]
async fn write_is_framed_with_channel_prefix() {
    let (mux, mut peer) = started(&[1], &[0]);
    let stdin = mux.outbound_stream(0).unwrap();

    within(stdin.write(b"foo\n")).await.unwrap();
    assert_eq!(within(peer.recv()).await, Some(binary(b"\x00foo\n")));
}

#[tokio::test]
async fn fragments_are_reassembled_into_one_message() {
    let (mux, peer) = started(&[1], &[0]);
    peer.send_fragment(&b"\x01he"[..], MessageKind::Binary, false)
        .unwrap();
    peer.send_fragment(&b"llo"[..], MessageKind::Binary, true)
        .unwrap();

    let stdout = mux.inbound_stream(1).unwrap();
    let mut buf = [0u8; 16];
    let n = within(stdout.read(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[tokio::test]
async fn undeclared_channel_is_discarded_and_buffers_released() {
    let (mux, peer) = started(&[1], &[0]);

    let mut first = vec![9u8];
    first.extend(std::iter::repeat(b'a').take(199));
    peer.send_fragment(first, MessageKind::Binary, false).unwrap();
    peer.send_fragment(vec![b'b'; 200], MessageKind::Binary, false)
        .unwrap();
    peer.send_fragment(vec![b'c'; 100], MessageKind::Binary, true)
        .unwrap();
    peer.send_binary(&b"\x01ok"[..]).unwrap();

    let stdout = mux.inbound_stream(1).unwrap();
    let chunk = within(stdout.read_chunk()).await.unwrap().unwrap();
    assert_eq!(chunk.as_ref(), b"ok");

    mux.shutdown(GRACE).await.unwrap();
    assert_eq!(mux.pool_stats().outstanding, 0);
    assert_eq!(stdout.pending_bytes(), 0);
}

#[tokio::test]
async fn shutdown_with_slow_write_returns_within_grace() {
    let (mux, mut peer) = setup(
        MuxConfig::default(),
        MemoryConfig {
            send_delay: Some(Duration::from_secs(30)),
            ..MemoryConfig::default()
        },
        &[1],
        &[0],
    );
    mux.start().unwrap();
    let completion = mux.outbound_stream(0).unwrap().enqueue(b"slow", None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    mux.shutdown(GRACE).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(within(completion).await.is_err());
    assert_eq!(mux.state(), MuxState::Stopped);
    assert_eq!(
        within(peer.recv()).await,
        Some(PeerEvent::Close(CloseStatus::normal()))
    );
}

#[tokio::test]
async fn writes_keep_enqueue_order_across_channels() {
    let (mux, mut peer) = started(&[1], &[0, 3]);
    let a = mux.outbound_stream(0).unwrap();
    let b = mux.outbound_stream(3).unwrap();

    let completions = vec![
        a.enqueue(b"one", None).unwrap(),
        b.enqueue(b"two", None).unwrap(),
        a.enqueue(b"three", None).unwrap(),
    ];
    for completion in completions {
        within(completion).await.unwrap();
    }

    assert_eq!(within(peer.recv()).await, Some(binary(b"\x00one")));
    assert_eq!(within(peer.recv()).await, Some(binary(b"\x03two")));
    assert_eq!(within(peer.recv()).await, Some(binary(b"\x00three")));
}

#[tokio::test]
async fn heartbeats_are_ignored() {
    let (mux, peer) = started(&[1], &[0]);
    peer.send_binary(&b"\x01"[..]).unwrap();
    peer.send_binary(&b""[..]).unwrap();
    // A one-byte fragment that is not final starts a real message.
    peer.send_fragment(&b"\x01"[..], MessageKind::Binary, false)
        .unwrap();
    peer.send_fragment(&b"ab"[..], MessageKind::Binary, true)
        .unwrap();

    let stdout = mux.inbound_stream(1).unwrap();
    let chunk = within(stdout.read_chunk()).await.unwrap().unwrap();
    assert_eq!(chunk.as_ref(), b"ab");
    assert_eq!(stdout.pending_bytes(), 0);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (mux, _peer) = started(&[1], &[0]);
    assert!(matches!(mux.start(), Err(MuxError::AlreadyStarted)));
    assert_eq!(mux.state(), MuxState::Running);
}

#[tokio::test]
async fn write_before_start_is_rejected() {
    let (mux, _peer) = setup(
        MuxConfig::default(),
        MemoryConfig::default(),
        &[1],
        &[0],
    );
    let stdin = mux.outbound_stream(0).unwrap();
    assert!(matches!(stdin.write(b"x").await, Err(MuxError::NotStarted)));
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (mux, mut peer) = started(&[1], &[0]);
    mux.shutdown(GRACE).await.unwrap();
    mux.shutdown(GRACE).await.unwrap();

    assert_eq!(
        within(peer.recv()).await,
        Some(PeerEvent::Close(CloseStatus::normal()))
    );
    assert!(peer.try_recv().is_none());
    assert!(mux.is_closed());

    let stdin = mux.outbound_stream(0).unwrap();
    assert!(matches!(stdin.write(b"late").await, Err(MuxError::Stopped)));
}

#[tokio::test]
async fn queued_writes_resolve_on_shutdown() {
    let (mux, _peer) = setup(
        MuxConfig::default(),
        MemoryConfig {
            send_delay: Some(Duration::from_secs(30)),
            ..MemoryConfig::default()
        },
        &[1],
        &[0],
    );
    mux.start().unwrap();
    let stdin = mux.outbound_stream(0).unwrap();
    let completions: Vec<_> = (0..3)
        .map(|i| stdin.enqueue(&[b'0' + i], None).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    mux.shutdown(GRACE).await.unwrap();
    for completion in completions {
        let result = within(completion).await;
        assert!(matches!(
            result,
            Err(MuxError::Cancelled) | Err(MuxError::Aborted)
        ));
    }
    assert_eq!(mux.pool_stats().outstanding, 0);
}

#[tokio::test]
async fn cancelled_write_resolves_without_transmission() {
    let (mux, mut peer) = setup(
        MuxConfig::default(),
        MemoryConfig {
            send_delay: Some(Duration::from_millis(200)),
            ..MemoryConfig::default()
        },
        &[1],
        &[0],
    );
    mux.start().unwrap();
    let stdin = mux.outbound_stream(0).unwrap();
    let token = tokio_util::sync::CancellationToken::new();

    let first = stdin.enqueue(b"first", None).unwrap();
    let second = stdin.enqueue(b"second", Some(token.clone())).unwrap();
    token.cancel();

    assert!(matches!(within(second).await, Err(MuxError::Cancelled)));
    within(first).await.unwrap();
    assert_eq!(within(peer.recv()).await, Some(binary(b"\x00first")));

    mux.shutdown(GRACE).await.unwrap();
    assert_eq!(
        within(peer.recv()).await,
        Some(PeerEvent::Close(CloseStatus::normal()))
    );
}

#[tokio::test]
async fn remote_close_completes_handshake() {
    let (mux, mut peer) = started(&[1], &[0]);
    peer.send_binary(&b"\x01bye"[..]).unwrap();
    peer.close(CloseStatus::new(1001, "going away")).unwrap();

    within(mux.closed()).await;
    assert_eq!(
        within(peer.recv()).await,
        Some(PeerEvent::Close(CloseStatus::new(1001, "going away")))
    );
    assert_eq!(mux.close_status().map(|s| s.code), Some(1001));

    let stdout = mux.inbound_stream(1).unwrap();
    assert_eq!(within(stdout.read_to_end()).await.unwrap(), b"bye");

    mux.shutdown(GRACE).await.unwrap();
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn premature_close_ends_streams_cleanly() {
    let (mux, peer) = started(&[1, 2], &[0]);
    peer.send_binary(&b"\x02partial"[..]).unwrap();
    drop(peer);

    within(mux.closed()).await;
    let stderr = mux.inbound_stream(2).unwrap();
    assert_eq!(within(stderr.read_to_end()).await.unwrap(), b"partial");
    let stdout = mux.inbound_stream(1).unwrap();
    assert!(within(stdout.read_chunk()).await.unwrap().is_none());
}

#[tokio::test]
async fn base64_protocol_round_trip() {
    let (mux, mut peer) = setup(
        MuxConfig {
            protocol: ChannelProtocol::Base64V1,
            ..MuxConfig::default()
        },
        MemoryConfig::default(),
        &[1],
        &[0],
    );
    mux.start().unwrap();

    within(mux.outbound_stream(0).unwrap().write(b"hello"))
        .await
        .unwrap();
    assert_eq!(
        within(peer.recv()).await,
        Some(PeerEvent::Message {
            kind: MessageKind::Text,
            data: "0aGVsbG8=".into(),
        })
    );

    peer.send_text("1!!not-base64").unwrap();
    peer.send_fragment("1d29y", MessageKind::Text, false).unwrap();
    peer.send_fragment("bGQ=", MessageKind::Text, true).unwrap();

    let stdout = mux.inbound_stream(1).unwrap();
    let chunk = within(stdout.read_chunk()).await.unwrap().unwrap();
    assert_eq!(chunk.as_ref(), b"world");
}

#[tokio::test]
async fn pending_byte_cap_fails_the_stream() {
    let (mux, peer) = setup(
        MuxConfig {
            max_pending_bytes: Some(4),
            ..MuxConfig::default()
        },
        MemoryConfig::default(),
        &[1],
        &[0],
    );
    mux.start().unwrap();
    peer.send_binary(&b"\x01abc"[..]).unwrap();
    peer.send_binary(&b"\x01de"[..]).unwrap();

    let stdout = mux.inbound_stream(1).unwrap();
    within(async {
        while !stdout.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(matches!(
        stdout.read_chunk().await,
        Err(MuxError::CapacityExceeded { index: 1, max: 4 })
    ));
}

#[tokio::test]
async fn reader_closed_channel_discards_later_data() {
    let (mux, peer) = started(&[1, 2], &[0]);
    let stdout = mux.inbound_stream(1).unwrap();
    stdout.close();

    peer.send_fragment(&b"\x01dis"[..], MessageKind::Binary, false)
        .unwrap();
    peer.send_fragment(&b"carded"[..], MessageKind::Binary, true)
        .unwrap();
    peer.send_binary(&b"\x02kept"[..]).unwrap();

    let stderr = mux.inbound_stream(2).unwrap();
    let chunk = within(stderr.read_chunk()).await.unwrap().unwrap();
    assert_eq!(chunk.as_ref(), b"kept");

    let mut buf = [0u8; 8];
    assert_eq!(stdout.read(&mut buf).await.unwrap(), 0);
    assert_eq!(stdout.pending_bytes(), 0);
}

#[tokio::test]
async fn io_traits_carry_bytes() {
    let (mux, mut peer) = started(&[1], &[0]);

    let mut stdin = mux.outbound_stream(0).unwrap();
    within(stdin.write_all(b"abc")).await.unwrap();
    within(stdin.flush()).await.unwrap();
    assert_eq!(within(peer.recv()).await, Some(binary(b"\x00abc")));

    peer.send_binary(&b"\x01line one\n"[..]).unwrap();
    peer.send_binary(&b"\x01line two\n"[..]).unwrap();
    peer.close(CloseStatus::normal()).unwrap();

    let mut stdout = mux.inbound_stream(1).unwrap();
    let mut text = String::new();
    within(stdout.read_to_string(&mut text)).await.unwrap();
    assert_eq!(text, "line one\nline two\n");
}

#[tokio::test]
async fn inbound_stream_yields_chunks() {
    use futures_core::Stream;

    let (mux, peer) = started(&[1], &[0]);
    peer.send_binary(&b"\x01a"[..]).unwrap();
    peer.send_binary(&b"\x01b"[..]).unwrap();
    drop(peer);

    let mut stdout = mux.inbound_stream(1).unwrap();
    let mut collected = Vec::new();
    while let Some(item) =
        within(std::future::poll_fn(|cx| Pin::new(&mut stdout).poll_next(cx))).await
    {
        collected.extend_from_slice(&item.unwrap());
    }
    assert_eq!(collected, b"ab");
}

#[tokio::test]
async fn drop_stops_pumps_and_ends_streams() {
    let (mux, mut peer) = started(&[1], &[0]);
    let stdout = mux.inbound_stream(1).unwrap();
    let stdin = mux.outbound_stream(0).unwrap();
    drop(mux);

    assert!(within(stdout.read_chunk()).await.unwrap().is_none());
    assert!(matches!(stdin.write(b"x").await, Err(MuxError::Stopped)));
    // Only `shutdown` performs the close handshake.
    assert!(peer.try_recv().is_none());
}

/// A connection assembled from separately chosen halves.
struct Halves<S, K> {
    source: S,
    sink: K,
}

impl<S: FragmentSource, K: MessageSink> DuplexConnection for Halves<S, K> {
    type Source = S;
    type Sink = K;

    fn split(self) -> (S, K) {
        (self.source, self.sink)
    }
}

fn memory_halves(memory: MemoryConfig) -> (MemorySource, MemorySink, MemoryPeer) {
    let (connection, peer) = duplex(memory);
    let (source, sink) = connection.split();
    (source, sink, peer)
}

/// Source that fails every receive with a protocol violation.
struct BrokenSource;

impl FragmentSource for BrokenSource {
    fn receive<'a>(
        &'a mut self,
        _buf: &'a mut [u8],
    ) -> impl Future<Output = chanmux_transport::Result<ReceiveResult>> + Send + 'a {
        async move { Err(TransportError::Protocol("bad opcode".into())) }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }
}

#[tokio::test]
async fn receive_failure_aborts_inbound_but_sending_continues() {
    let (_source, sink, mut peer) = memory_halves(MemoryConfig::default());
    let connection = Halves {
        source: BrokenSource,
        sink,
    };
    let mux = Multiplexer::new(connection, [1, 2], [0]).unwrap();
    mux.start().unwrap();

    let stdout = mux.inbound_stream(1).unwrap();
    assert!(matches!(
        within(stdout.read_chunk()).await,
        Err(MuxError::ChannelAborted(1))
    ));
    let stderr = mux.inbound_stream(2).unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        within(stderr.read(&mut buf)).await,
        Err(MuxError::ChannelAborted(2))
    ));

    within(mux.outbound_stream(0).unwrap().write(b"x"))
        .await
        .unwrap();
    assert_eq!(within(peer.recv()).await, Some(binary(b"\x00x")));
}

/// Source that records when the receive pump lets go of it.
struct TrackedSource {
    inner: MemorySource,
    dropped: Arc<AtomicBool>,
}

impl FragmentSource for TrackedSource {
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = chanmux_transport::Result<ReceiveResult>> + Send + 'a {
        self.inner.receive(buf)
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }
}

impl Drop for TrackedSource {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Sink whose transmissions take `delay` and ignore cancellation.
struct StubbornSink {
    inner: MemorySink,
    delay: Duration,
}

impl MessageSink for StubbornSink {
    fn send<'a>(
        &'a mut self,
        message: &'a [u8],
        kind: MessageKind,
        _cancel: &'a CancellationToken,
    ) -> impl Future<Output = chanmux_transport::Result<()>> + Send + 'a {
        async move {
            tokio::time::sleep(self.delay).await;
            self.inner
                .send(message, kind, &CancellationToken::new())
                .await
        }
    }

    fn close(
        &mut self,
        status: CloseStatus,
    ) -> impl Future<Output = chanmux_transport::Result<()>> + Send + '_ {
        self.inner.close(status)
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }
}

#[tokio::test]
async fn shutdown_interrupts_close_answer_blocked_by_slow_send() {
    let (source, sink, peer) = memory_halves(MemoryConfig::default());
    let dropped = Arc::new(AtomicBool::new(false));
    let connection = Halves {
        source: TrackedSource {
            inner: source,
            dropped: Arc::clone(&dropped),
        },
        sink: StubbornSink {
            inner: sink,
            delay: Duration::from_secs(30),
        },
    };
    let mux = Multiplexer::new(connection, [1], [0]).unwrap();
    mux.start().unwrap();

    // Occupy the sink, then have the peer start closing.
    let _stuck = mux.outbound_stream(0).unwrap().enqueue(b"slow", None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.close(CloseStatus::normal()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    mux.shutdown(GRACE).await.unwrap();
    within(async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(mux.is_closed());
    assert_eq!(mux.state(), MuxState::Stopped);
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn events_go_to_injected_dispatch() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let (mux, peer) = setup(
        MuxConfig {
            dispatch: Some(tracing::Dispatch::new(subscriber)),
            ..MuxConfig::default()
        },
        MemoryConfig::default(),
        &[1],
        &[0],
    );
    mux.start().unwrap();
    peer.send_binary(&b"\x07stray"[..]).unwrap();
    peer.send_binary(&b"\x01ok"[..]).unwrap();
    within(mux.inbound_stream(1).unwrap().read_chunk())
        .await
        .unwrap();
    mux.shutdown(GRACE).await.unwrap();

    let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("receive pump started"));
    assert!(output.contains("send pump started"));
    assert!(output.contains("discarding message for undeclared channel"));
    assert!(output.contains("multiplexer stopped"));
}

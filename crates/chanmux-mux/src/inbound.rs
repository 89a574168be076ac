//! Receiving side of a channel.
//!
//! The receive pump appends whole messages; readers drain them in order.
//! Each message is stored as one or more pooled chunks so no bytes are
//! copied until a reader asks for them.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll, Waker};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{trace, warn};

use crate::buffer::PooledBuffer;
use crate::error::{MuxError, Result};
use crate::state::{Lifecycle, MuxState};

/// Part of a received message: a pooled buffer and the offset its payload
/// starts at (1 for the first fragment, past the channel prefix).
#[derive(Debug)]
pub(crate) struct Chunk {
    buf: PooledBuffer,
    pos: usize,
}

impl Chunk {
    pub(crate) fn new(buf: PooledBuffer, pos: usize) -> Self {
        Self { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

/// Why a stream will yield no more data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// Queued data stays readable, then end of stream.
    Finished,
    /// The reader closed the stream.
    Closed,
    /// The receive pump failed.
    Aborted,
    /// The pending byte cap was exceeded.
    Overflowed { max: usize },
}

/// Result of handing a message to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Append {
    Queued,
    /// The stream no longer accepts data; the message was released.
    Discarded,
    /// The message pushed the stream over its cap; the stream failed.
    Overflowed,
}

#[derive(Debug, Default)]
struct InboundState {
    chunks: VecDeque<Chunk>,
    pending_bytes: usize,
    end: Option<StreamEnd>,
    wakers: Vec<Waker>,
}

impl InboundState {
    fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    fn register(&mut self, cx: &Context<'_>) {
        if !self.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            self.wakers.push(cx.waker().clone());
        }
    }

    fn discard_queued(&mut self) {
        self.chunks.clear();
        self.pending_bytes = 0;
    }
}

#[derive(Debug)]
struct InboundShared {
    index: u8,
    max_pending_bytes: Option<usize>,
    lifecycle: Arc<Lifecycle>,
    state: Mutex<InboundState>,
}

/// Readable byte stream for one inbound channel index.
///
/// Handles are cheap to clone and share one queue. Implements
/// [`AsyncRead`] and `Stream<Item = Result<Bytes>>`.
#[derive(Debug)]
pub struct InboundStream {
    shared: Arc<InboundShared>,
    /// Set once this handle's `Stream` impl has yielded its last item.
    terminated: bool,
}

impl Clone for InboundStream {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            terminated: false,
        }
    }
}

impl InboundStream {
    pub(crate) fn new(
        index: u8,
        max_pending_bytes: Option<usize>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            shared: Arc::new(InboundShared {
                index,
                max_pending_bytes,
                lifecycle,
                state: Mutex::new(InboundState::default()),
            }),
            terminated: false,
        }
    }

    /// The channel index this stream receives.
    pub fn index(&self) -> u8 {
        self.shared.index
    }

    /// Bytes received but not yet read.
    pub fn pending_bytes(&self) -> usize {
        self.lock().pending_bytes
    }

    /// True once the stream will accept no more data.
    pub fn is_closed(&self) -> bool {
        self.lock().end.is_some()
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        std::future::poll_fn(|cx| self.poll_read_into(cx, buf)).await
    }

    /// Read the remainder of the oldest queued chunk. `None` at end of stream.
    pub async fn read_chunk(&self) -> Result<Option<Bytes>> {
        std::future::poll_fn(|cx| self.poll_read_chunk(cx)).await
    }

    /// Read until end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Stop receiving. Queued data is dropped and later messages for this
    /// index are discarded by the receive pump. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.discard_queued();
        state.end = Some(StreamEnd::Closed);
        state.wake_all();
        trace!(channel = self.shared.index, "inbound channel closed by reader");
    }

    pub(crate) fn accepts_data(&self) -> bool {
        self.lock().end.is_none()
    }

    /// Queue one complete message. Readers see all of it or none of it.
    pub(crate) fn append(&self, chunks: Vec<Chunk>) -> Append {
        let mut state = self.lock();
        if state.end.is_some() {
            return Append::Discarded;
        }

        let len: usize = chunks.iter().map(Chunk::remaining).sum();
        if let Some(max) = self.shared.max_pending_bytes {
            if state.pending_bytes + len > max {
                warn!(
                    channel = self.shared.index,
                    pending = state.pending_bytes,
                    len,
                    max,
                    "inbound channel exceeded pending byte cap"
                );
                state.discard_queued();
                state.end = Some(StreamEnd::Overflowed { max });
                state.wake_all();
                return Append::Overflowed;
            }
        }

        state
            .chunks
            .extend(chunks.into_iter().filter(|c| c.remaining() > 0));
        state.pending_bytes += len;
        state.wake_all();
        Append::Queued
    }

    /// No more data will arrive; queued data stays readable.
    pub(crate) fn finish(&self) {
        self.end_with(StreamEnd::Finished);
    }

    /// The receive pump failed; readers get an error after the queue drains.
    pub(crate) fn abort(&self) {
        self.end_with(StreamEnd::Aborted);
    }

    fn end_with(&self, end: StreamEnd) {
        let mut state = self.lock();
        if state.end.is_none() {
            state.end = Some(end);
        }
        state.wake_all();
    }

    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Outcome for a reader that found the queue empty.
    fn poll_drained(&self, state: &mut InboundState, cx: &Context<'_>) -> Poll<Result<()>> {
        match state.end {
            None => {
                state.register(cx);
                Poll::Pending
            }
            Some(StreamEnd::Finished | StreamEnd::Closed) => Poll::Ready(Ok(())),
            Some(StreamEnd::Aborted) => Poll::Ready(Err(MuxError::ChannelAborted(self.shared.index))),
            Some(StreamEnd::Overflowed { max }) => Poll::Ready(Err(MuxError::CapacityExceeded {
                index: self.shared.index,
                max,
            })),
        }
    }

    fn check_started(&self) -> Result<()> {
        if self.shared.lifecycle.get() == MuxState::Created {
            return Err(MuxError::NotStarted);
        }
        Ok(())
    }

    fn poll_read_into(&self, cx: &mut Context<'_>, dst: &mut [u8]) -> Poll<Result<usize>> {
        self.check_started()?;
        if dst.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut state = self.lock();
        let mut copied = 0;
        while copied < dst.len() {
            let Some(chunk) = state.chunks.front_mut() else {
                break;
            };
            let n = chunk.remaining().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk.buf[chunk.pos..chunk.pos + n]);
            chunk.pos += n;
            copied += n;
            if chunk.remaining() == 0 {
                state.chunks.pop_front();
            }
        }

        if copied > 0 {
            state.pending_bytes -= copied;
            return Poll::Ready(Ok(copied));
        }
        ready!(self.poll_drained(&mut state, cx))?;
        Poll::Ready(Ok(0))
    }

    fn poll_read_chunk(&self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>>> {
        self.check_started()?;

        let mut state = self.lock();
        if let Some(chunk) = state.chunks.pop_front() {
            state.pending_bytes -= chunk.remaining();
            return Poll::Ready(Ok(Some(Bytes::copy_from_slice(&chunk.buf[chunk.pos..]))));
        }
        ready!(self.poll_drained(&mut state, cx))?;
        Poll::Ready(Ok(None))
    }
}

impl AsyncRead for InboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = ready!(self.poll_read_into(cx, buf.initialize_unfilled())).map_err(io::Error::from)?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl futures_core::Stream for InboundStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        let item = ready!(self.poll_read_chunk(cx)).transpose();
        if !matches!(item, Some(Ok(_))) {
            self.terminated = true;
        }
        Poll::Ready(item)
    }
}

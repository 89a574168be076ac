use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use chanmux_frame::{ChannelProtocol, PREFIX_SIZE};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::buffer::BufferPool;
use crate::error::{MuxError, Result};
use crate::pending::{PendingWrite, WriteCompletion};
use crate::state::{Lifecycle, MuxState};

/// Shared entry point into the send queue.
#[derive(Debug)]
pub(crate) struct SendQueue {
    tx: mpsc::UnboundedSender<PendingWrite>,
    lifecycle: Arc<Lifecycle>,
    pool: BufferPool,
    protocol: ChannelProtocol,
}

impl SendQueue {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<PendingWrite>,
        lifecycle: Arc<Lifecycle>,
        pool: BufferPool,
        protocol: ChannelProtocol,
    ) -> Self {
        Self {
            tx,
            lifecycle,
            pool,
            protocol,
        }
    }

    /// Frame `data` for `channel` and queue it as one message.
    pub(crate) fn enqueue(
        &self,
        channel: u8,
        data: &[u8],
        cancel: Option<CancellationToken>,
    ) -> Result<WriteCompletion> {
        match self.lifecycle.get() {
            MuxState::Created => return Err(MuxError::NotStarted),
            MuxState::Draining | MuxState::Stopped => return Err(MuxError::Stopped),
            MuxState::Running => {}
        }

        let mut frame = self.pool.rent_empty(PREFIX_SIZE + data.len());
        self.protocol.encode(channel, data, &mut frame)?;
        let (write, completion) =
            PendingWrite::new(channel, frame, self.protocol.message_kind(), cancel);

        // A refused write is dropped here, which resolves it as aborted.
        self.tx.send(write).map_err(|_| MuxError::Stopped)?;
        trace!(channel, len = data.len(), "write queued");
        Ok(completion)
    }
}

/// Writable byte stream for one outbound channel index.
///
/// Every write becomes exactly one message on the connection, in call
/// order across all outbound streams of the multiplexer.
#[derive(Debug)]
pub struct OutboundStream {
    index: u8,
    queue: Arc<SendQueue>,
    /// Write started by `poll_write` that has not resolved yet.
    in_flight: Option<WriteCompletion>,
}

impl Clone for OutboundStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            queue: Arc::clone(&self.queue),
            in_flight: None,
        }
    }
}

impl OutboundStream {
    pub(crate) fn new(index: u8, queue: Arc<SendQueue>) -> Self {
        Self {
            index,
            queue,
            in_flight: None,
        }
    }

    /// The channel index this stream writes to.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Queue `data` without waiting for transmission.
    ///
    /// Fails at once with [`MuxError::NotStarted`] or [`MuxError::Stopped`]
    /// if the send pump is not running. The returned completion resolves
    /// once the message is on the wire, cancelled or abandoned.
    pub fn enqueue(
        &self,
        data: &[u8],
        cancel: Option<CancellationToken>,
    ) -> Result<WriteCompletion> {
        self.queue.enqueue(self.index, data, cancel)
    }

    /// Write `data` as one message and wait for it to be transmitted.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.enqueue(data, None)?.await
    }

    /// Like [`write`](Self::write), giving up with [`MuxError::Cancelled`]
    /// when `cancel` fires before the message is transmitted.
    pub async fn write_with_cancel(&self, data: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.enqueue(data, Some(cancel.clone()))?.await
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(completion) = self.in_flight.as_mut() {
            let result = ready!(Pin::new(completion).poll(cx));
            self.in_flight = None;
            result.map_err(io::Error::from)?;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let completion = this.enqueue(buf, None).map_err(io::Error::from)?;
        this.in_flight = Some(completion);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(state: MuxState) -> (OutboundStream, mpsc::UnboundedReceiver<PendingWrite>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set(state);
        let queue = SendQueue::new(tx, lifecycle, BufferPool::new(), ChannelProtocol::V1);
        (OutboundStream::new(0, Arc::new(queue)), rx)
    }

    #[test]
    fn enqueue_before_start_fails() {
        let (stream, _rx) = stream(MuxState::Created);
        assert!(matches!(
            stream.enqueue(b"x", None),
            Err(MuxError::NotStarted)
        ));
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let (stream, _rx) = stream(MuxState::Stopped);
        assert!(matches!(stream.enqueue(b"x", None), Err(MuxError::Stopped)));
    }

    #[tokio::test]
    async fn enqueue_frames_with_channel_prefix() {
        let (stream, mut rx) = stream(MuxState::Running);
        let completion = stream.enqueue(b"foo\n", None).unwrap();

        let write = rx.recv().await.unwrap();
        assert_eq!(write.channel(), 0);
        assert_eq!(write.frame(), b"\x00foo\n");
        write.complete(Ok(()));
        assert!(completion.await.is_ok());
    }

    #[tokio::test]
    async fn closed_queue_reports_stopped() {
        let (stream, rx) = stream(MuxState::Running);
        drop(rx);
        assert!(matches!(stream.enqueue(b"x", None), Err(MuxError::Stopped)));
    }
}

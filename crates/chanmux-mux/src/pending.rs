use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chanmux_transport::MessageKind;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::buffer::PooledBuffer;
use crate::error::{MuxError, Result};

/// A framed message waiting for the send pump.
///
/// The completion is resolved exactly once: by [`PendingWrite::complete`],
/// or with [`MuxError::Aborted`] if the write is dropped unsent.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    channel: u8,
    frame: PooledBuffer,
    kind: MessageKind,
    cancel: Option<CancellationToken>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

impl PendingWrite {
    pub(crate) fn new(
        channel: u8,
        frame: PooledBuffer,
        kind: MessageKind,
        cancel: Option<CancellationToken>,
    ) -> (Self, WriteCompletion) {
        let (tx, rx) = oneshot::channel();
        let cancelled = cancel
            .as_ref()
            .map(|token| Box::pin(token.clone().cancelled_owned()));
        let write = Self {
            channel,
            frame,
            kind,
            cancel,
            completion: Some(tx),
        };
        (write, WriteCompletion { rx, cancelled })
    }

    pub(crate) fn channel(&self) -> u8 {
        self.channel
    }

    /// The complete wire message, channel prefix included.
    pub(crate) fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub(crate) fn kind(&self) -> MessageKind {
        self.kind
    }

    pub(crate) fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolve the writer's completion and release the frame buffer.
    pub(crate) fn complete(mut self, result: Result<()>) {
        if let Some(tx) = self.completion.take() {
            // The writer may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(MuxError::Aborted));
        }
    }
}

/// Resolves when a write has been transmitted, cancelled or abandoned.
///
/// A write whose cancellation token fires resolves with
/// [`MuxError::Cancelled`] at once, even while it is still queued.
#[must_use = "a write completion does nothing unless awaited"]
#[derive(Debug)]
pub struct WriteCompletion {
    rx: oneshot::Receiver<Result<()>>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl Future for WriteCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(result),
            Poll::Ready(Err(_)) => return Poll::Ready(Err(MuxError::Aborted)),
            Poll::Pending => {}
        }
        if let Some(cancelled) = self.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(MuxError::Cancelled));
            }
        }
        Poll::Pending
    }
}

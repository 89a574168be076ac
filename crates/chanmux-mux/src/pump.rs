//! The receive and send loops driving a multiplexer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::BytesMut;
use chanmux_frame::{is_heartbeat, ChannelProtocol};
use chanmux_transport::{CloseStatus, FragmentSource, MessageSink, ReceiveResult, TransportError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::{MuxError, Result};
use crate::inbound::{Append, Chunk, InboundStream};
use crate::pending::PendingWrite;

/// What the receive loop does after handling a message.
enum Flow {
    Continue,
    Stop,
}

/// Reads fragments off the connection and routes them to inbound streams.
pub(crate) struct ReceivePump<S, K> {
    pub(crate) source: S,
    pub(crate) sink: Arc<Mutex<K>>,
    pub(crate) inbound: Arc<HashMap<u8, InboundStream>>,
    pub(crate) pool: BufferPool,
    pub(crate) buffer_size: usize,
    pub(crate) protocol: ChannelProtocol,
    pub(crate) cancel: CancellationToken,
    /// Cancelled once the connection is known to be closed.
    pub(crate) closed: CancellationToken,
    pub(crate) remote_close: Arc<StdMutex<Option<CloseStatus>>>,
}

impl<S: FragmentSource, K: MessageSink> ReceivePump<S, K> {
    pub(crate) async fn run(mut self) {
        debug!("receive pump started");
        match self.receive_loop().await {
            Ok(()) => {
                debug!("receive pump stopped");
                self.finish_streams();
            }
            Err(err) if err.is_premature_close() => {
                debug!("connection closed without close handshake");
                self.finish_streams();
                self.closed.cancel();
            }
            Err(err) => {
                error!(error = %err, "receive pump failed");
                for stream in self.inbound.values() {
                    stream.abort();
                }
            }
        }
    }

    fn finish_streams(&self) {
        for stream in self.inbound.values() {
            stream.finish();
        }
    }

    async fn receive_loop(&mut self) -> Result<()> {
        while !self.cancel.is_cancelled() && self.source.state().is_open() {
            let Some((buf, result)) = self.next_fragment().await? else {
                return Ok(());
            };
            if result.is_close() {
                self.complete_close(result).await;
                return Ok(());
            }
            if is_heartbeat(result.count, result.end_of_message) {
                trace!(len = result.count, "heartbeat");
                continue;
            }
            if result.count == 0 {
                // Empty leading fragment; the channel prefix is still to come.
                continue;
            }

            let flow = match self.protocol {
                ChannelProtocol::V1 => self.route_binary(buf, result).await?,
                ChannelProtocol::Base64V1 => self.route_base64(buf, result).await?,
            };
            if let Flow::Stop = flow {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Receive one fragment into a fresh pooled buffer, truncated to the
    /// received length. `None` once cancelled.
    async fn next_fragment(&mut self) -> Result<Option<(PooledBuffer, ReceiveResult)>> {
        let mut buf = self.pool.rent(self.buffer_size);
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = self.source.receive(&mut buf) => result?,
        };
        buf.truncate(result.count);
        Ok(Some((buf, result)))
    }

    async fn route_binary(&mut self, first: PooledBuffer, result: ReceiveResult) -> Result<Flow> {
        let index = first[0];
        let stream = match self.inbound.get(&index) {
            Some(stream) if stream.accepts_data() => stream.clone(),
            Some(_) => {
                trace!(channel = index, "discarding message for closed channel");
                drop(first);
                return self.discard_remainder(result.end_of_message).await;
            }
            None => {
                trace!(channel = index, "discarding message for undeclared channel");
                drop(first);
                return self.discard_remainder(result.end_of_message).await;
            }
        };

        trace!(
            channel = index,
            len = result.count - 1,
            end_of_message = result.end_of_message,
            "received fragment"
        );
        let mut chunks = vec![Chunk::new(first, 1)];
        let mut end_of_message = result.end_of_message;
        while !end_of_message {
            let Some((buf, result)) = self.next_fragment().await? else {
                return Ok(Flow::Stop);
            };
            if result.is_close() {
                self.complete_close(result).await;
                return Ok(Flow::Stop);
            }
            trace!(
                channel = index,
                len = result.count,
                end_of_message = result.end_of_message,
                "received continuation fragment"
            );
            end_of_message = result.end_of_message;
            if !stream.accepts_data() {
                drop(chunks);
                trace!(channel = index, "channel closed mid-message; discarding remainder");
                return self.discard_remainder(end_of_message).await;
            }
            chunks.push(Chunk::new(buf, 0));
        }

        if stream.append(chunks) == Append::Discarded {
            trace!(channel = index, "channel closed before delivery; message discarded");
        }
        Ok(Flow::Continue)
    }

    async fn route_base64(&mut self, first: PooledBuffer, result: ReceiveResult) -> Result<Flow> {
        let mut message = BytesMut::from(&first[..]);
        drop(first);
        let mut end_of_message = result.end_of_message;
        while !end_of_message {
            let Some((buf, result)) = self.next_fragment().await? else {
                return Ok(Flow::Stop);
            };
            if result.is_close() {
                self.complete_close(result).await;
                return Ok(Flow::Stop);
            }
            message.extend_from_slice(&buf);
            end_of_message = result.end_of_message;
        }

        let decoded = match self.protocol.decode(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, len = message.len(), "dropping undecodable message");
                return Ok(Flow::Continue);
            }
        };
        let Some(stream) = self.inbound.get(&decoded.channel) else {
            trace!(channel = decoded.channel, "discarding message for undeclared channel");
            return Ok(Flow::Continue);
        };
        trace!(channel = decoded.channel, len = decoded.payload.len(), "received message");

        let mut buf = self.pool.rent_empty(decoded.payload.len());
        buf.extend_from_slice(&decoded.payload);
        if stream.append(vec![Chunk::new(buf, 0)]) == Append::Discarded {
            trace!(channel = decoded.channel, "discarding message for closed channel");
        }
        Ok(Flow::Continue)
    }

    /// Read and release fragments until the end of the current message.
    async fn discard_remainder(&mut self, mut end_of_message: bool) -> Result<Flow> {
        while !end_of_message {
            let Some((_buf, result)) = self.next_fragment().await? else {
                return Ok(Flow::Stop);
            };
            if result.is_close() {
                self.complete_close(result).await;
                return Ok(Flow::Stop);
            }
            end_of_message = result.end_of_message;
        }
        Ok(Flow::Continue)
    }

    /// Answer the peer's close message with the same status.
    async fn complete_close(&mut self, result: ReceiveResult) {
        let status = result.close_status.unwrap_or_else(CloseStatus::normal);
        debug!(
            code = status.code,
            reason = %status.reason,
            "received first half of close handshake"
        );
        *self
            .remote_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status.clone());

        // The send pump may hold the sink through a slow transmit.
        let cancel = self.cancel.clone();
        let mut sink = tokio::select! {
            biased;
            sink = self.sink.lock() => sink,
            _ = cancel.cancelled() => {
                debug!("shutdown requested before close handshake was answered");
                self.closed.cancel();
                return;
            }
        };
        if sink.state().awaits_local_close() {
            match sink.close(status).await {
                Ok(()) => debug!("sent second half of close handshake"),
                Err(err) => warn!(error = %err, "failed to complete close handshake"),
            }
        }
        drop(sink);
        self.closed.cancel();
    }
}

/// Transmits queued writes one at a time.
pub(crate) struct SendPump<K> {
    pub(crate) sink: Arc<Mutex<K>>,
    pub(crate) queue: mpsc::UnboundedReceiver<PendingWrite>,
    pub(crate) cancel: CancellationToken,
}

impl<K: MessageSink> SendPump<K> {
    pub(crate) async fn run(mut self) {
        debug!("send pump started");
        loop {
            let write = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                write = self.queue.recv() => match write {
                    Some(write) => write,
                    None => break,
                },
            };
            self.transmit(write).await;
        }

        self.queue.close();
        let mut aborted = 0usize;
        while let Ok(write) = self.queue.try_recv() {
            write.complete(Err(MuxError::Aborted));
            aborted += 1;
        }
        debug!(aborted, "send pump stopped");
    }

    async fn transmit(&mut self, write: PendingWrite) {
        let channel = write.channel();
        if write.is_cancelled() || self.cancel.is_cancelled() {
            trace!(channel, "skipping cancelled write");
            write.complete(Err(MuxError::Cancelled));
            return;
        }

        let linked = self.cancel.child_token();
        let result = {
            let mut sink = self.sink.lock().await;
            let send = sink.send(write.frame(), write.kind(), &linked);
            tokio::pin!(send);
            let early = match write.cancel_token() {
                Some(token) => tokio::select! {
                    biased;
                    result = &mut send => Some(result),
                    _ = token.cancelled() => None,
                },
                None => Some((&mut send).await),
            };
            match early {
                Some(result) => result,
                None => {
                    // The sink decides whether stopping is safe.
                    linked.cancel();
                    send.await
                }
            }
        };

        let result = match result {
            Ok(()) => {
                trace!(channel, len = write.frame().len(), "write transmitted");
                Ok(())
            }
            Err(TransportError::Cancelled) => {
                trace!(channel, "write cancelled during transmission");
                Err(MuxError::Cancelled)
            }
            Err(err) => {
                debug!(channel, error = %err, "write failed");
                Err(MuxError::Transport(err))
            }
        };
        write.complete(result);
    }
}

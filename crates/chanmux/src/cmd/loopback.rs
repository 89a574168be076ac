use std::time::Duration;

use bytes::BytesMut;
use chanmux_frame::{exec_channel_name, ChannelProtocol};
use chanmux_mux::{Multiplexer, MuxConfig};
use chanmux_transport::{duplex, MemoryConfig, MemoryPeer, PeerEvent};
use tracing::{debug, warn};

use crate::cmd::{parse_duration, LoopbackArgs};
use crate::exit::{io_error, mux_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT, USAGE};
use crate::output::{payload_preview, print_loopback, ChannelReport, LoopbackReport, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let grace = parse_duration(&args.grace)?;
    let timeout = parse_duration(&args.timeout)?;
    if !args.inbound.contains(&args.echo_to) {
        return Err(CliError::new(
            USAGE,
            format!(
                "--echo-to {} is not one of the inbound channels {:?}",
                args.echo_to, args.inbound
            ),
        ));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))?;
    let report = runtime.block_on(run_loopback(&args, grace, timeout))?;

    print_loopback(&report, format);
    Ok(SUCCESS)
}

async fn run_loopback(
    args: &LoopbackArgs,
    grace: Duration,
    timeout: Duration,
) -> CliResult<LoopbackReport> {
    let protocol = ChannelProtocol::from(args.protocol);
    let (connection, peer) = duplex(MemoryConfig {
        max_fragment_size: args.fragment_size,
        ..MemoryConfig::default()
    });
    let config = MuxConfig {
        protocol,
        shutdown_grace: grace,
        ..MuxConfig::default()
    };
    let mux = Multiplexer::with_config(
        connection,
        args.inbound.iter().copied(),
        [args.outbound],
        config,
    )
    .map_err(|err| mux_error("invalid channel layout", err))?;
    mux.start().map_err(|err| mux_error("start failed", err))?;
    let echo = tokio::spawn(echo_peer(peer, protocol, args.echo_to));

    let writer = mux
        .outbound_stream(args.outbound)
        .ok_or_else(|| CliError::new(INTERNAL, "outbound stream missing"))?;
    let mut bytes_sent = 0;
    for data in &args.data {
        writer
            .write(data.as_bytes())
            .await
            .map_err(|err| mux_error("write failed", err))?;
        bytes_sent += data.len();
    }

    let echoed = mux
        .inbound_stream(args.echo_to)
        .ok_or_else(|| CliError::new(INTERNAL, "echo stream missing"))?;
    let arrived = tokio::time::timeout(timeout, async {
        while echoed.pending_bytes() < bytes_sent && !echoed.is_closed() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    mux.shutdown(grace)
        .await
        .map_err(|err| mux_error("shutdown failed", err))?;
    if tokio::time::timeout(grace, echo).await.is_err() {
        debug!("echo peer still running after shutdown");
    }

    let mut received = Vec::new();
    for index in mux.inbound_indexes() {
        let Some(stream) = mux.inbound_stream(index) else {
            continue;
        };
        let data = stream
            .read_to_end()
            .await
            .map_err(|err| mux_error("read failed", err))?;
        received.push(ChannelReport {
            channel: index,
            channel_name: exec_channel_name(index),
            bytes: data.len(),
            payload: payload_preview(&data),
        });
    }

    if arrived.is_err() {
        return Err(CliError::new(
            TIMEOUT,
            format!("timed out after {timeout:?} waiting for echoed data"),
        ));
    }

    Ok(LoopbackReport {
        protocol: protocol.subprotocol(),
        messages_sent: args.data.len(),
        bytes_sent,
        received,
        state: format!("{:?}", mux.state()),
        pool: mux.pool_stats(),
    })
}

/// Remote side of the loopback: answers every message on `echo_to`.
async fn echo_peer(mut peer: MemoryPeer, protocol: ChannelProtocol, echo_to: u8) {
    while let Some(event) = peer.recv().await {
        match event {
            PeerEvent::Message { data, .. } => {
                let message = match protocol.decode(&data) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "echo peer dropped undecodable message");
                        continue;
                    }
                };
                let mut reply = BytesMut::new();
                if let Err(err) = protocol.encode(echo_to, &message.payload, &mut reply) {
                    warn!(error = %err, "echo peer could not encode reply");
                    continue;
                }
                debug!(
                    from = message.channel,
                    to = echo_to,
                    len = message.payload.len(),
                    "echo peer replying"
                );
                if peer
                    .send_fragment(reply.freeze(), protocol.message_kind(), true)
                    .is_err()
                {
                    break;
                }
            }
            PeerEvent::Close(status) => {
                debug!(code = status.code, "echo peer received close");
                break;
            }
        }
    }
}

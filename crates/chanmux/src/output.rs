use std::io::{IsTerminal, Write};

use chanmux_frame::{exec_channel_name, ChannelProtocol, Message};
use chanmux_mux::PoolStats;
use chanmux_transport::MessageKind;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct EncodedOutput<'a> {
    protocol: &'a str,
    channel: u8,
    channel_name: &'a str,
    message_kind: &'a str,
    size: usize,
    hex: String,
}

pub fn print_encoded(protocol: ChannelProtocol, channel: u8, wire: &[u8], format: OutputFormat) {
    let kind = kind_name(protocol.message_kind());
    match format {
        OutputFormat::Json => {
            let out = EncodedOutput {
                protocol: protocol.subprotocol(),
                channel,
                channel_name: exec_channel_name(channel),
                message_kind: kind,
                size: wire.len(),
                hex: to_hex(wire),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "KIND", "SIZE", "HEX"])
                .add_row(vec![
                    format!("{channel} ({})", exec_channel_name(channel)),
                    kind.to_string(),
                    wire.len().to_string(),
                    to_hex(wire),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "protocol={} channel={} ({}) kind={} size={} hex={}",
                protocol,
                channel,
                exec_channel_name(channel),
                kind,
                wire.len(),
                to_hex(wire)
            );
        }
        OutputFormat::Raw => print_raw(wire),
    }
}

#[derive(Serialize)]
struct DecodedOutput<'a> {
    protocol: &'a str,
    channel: u8,
    channel_name: &'a str,
    payload_size: usize,
    payload: String,
}

pub fn print_decoded(protocol: ChannelProtocol, message: &Message, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = DecodedOutput {
                protocol: protocol.subprotocol(),
                channel: message.channel,
                channel_name: exec_channel_name(message.channel),
                payload_size: message.payload.len(),
                payload: payload_preview(&message.payload),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    format!("{} ({})", message.channel, exec_channel_name(message.channel)),
                    message.payload.len().to_string(),
                    payload_preview(&message.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "channel={} ({}) size={} payload={}",
                message.channel,
                exec_channel_name(message.channel),
                message.payload.len(),
                payload_preview(&message.payload)
            );
        }
        OutputFormat::Raw => print_raw(&message.payload),
    }
}

/// Data collected from one inbound channel during a loopback run.
#[derive(Serialize)]
pub struct ChannelReport {
    pub channel: u8,
    pub channel_name: &'static str,
    pub bytes: usize,
    pub payload: String,
}

/// Summary of a loopback run.
#[derive(Serialize)]
pub struct LoopbackReport {
    pub protocol: &'static str,
    pub messages_sent: usize,
    pub bytes_sent: usize,
    pub received: Vec<ChannelReport>,
    pub state: String,
    pub pool: PoolStats,
}

pub fn print_loopback(report: &LoopbackReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "BYTES", "PAYLOAD"]);
            for channel in &report.received {
                table.add_row(vec![
                    format!("{} ({})", channel.channel, channel.channel_name),
                    channel.bytes.to_string(),
                    channel.payload.clone(),
                ]);
            }
            println!("{table}");
            println!(
                "sent {} messages ({} bytes) over {}; state={} pool outstanding={} rented={}",
                report.messages_sent,
                report.bytes_sent,
                report.protocol,
                report.state,
                report.pool.outstanding,
                report.pool.rented
            );
        }
        OutputFormat::Pretty => {
            for channel in &report.received {
                println!(
                    "channel={} ({}) bytes={} payload={}",
                    channel.channel, channel.channel_name, channel.bytes, channel.payload
                );
            }
            println!(
                "sent={} bytes_sent={} protocol={} state={} outstanding={}",
                report.messages_sent,
                report.bytes_sent,
                report.protocol,
                report.state,
                report.pool.outstanding
            );
        }
        OutputFormat::Raw => {
            for channel in &report.received {
                print_raw(channel.payload.as_bytes());
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn kind_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Binary => "binary",
        MessageKind::Text => "text",
        MessageKind::Close => "close",
    }
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_pairs() {
        assert_eq!(to_hex(&[0x00, 0x0a, 0xff]), "000aff");
    }

    #[test]
    fn binary_payload_preview() {
        assert_eq!(payload_preview(b"ok"), "ok");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}

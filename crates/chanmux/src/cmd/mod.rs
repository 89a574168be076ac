use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use chanmux_frame::ChannelProtocol;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod encode;
pub mod loopback;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encode a payload as one channel message.
    Encode(EncodeArgs),
    /// Decode one channel message.
    Decode(DecodeArgs),
    /// Run a multiplexer against an in-process echo peer.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Encode(args) => encode::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Wire protocol selector.
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
pub enum ProtocolArg {
    /// channel.k8s.io (binary, raw channel byte).
    #[default]
    V1,
    /// base64.channel.k8s.io (text, ASCII digit channel).
    Base64,
}

impl From<ProtocolArg> for ChannelProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::V1 => ChannelProtocol::V1,
            ProtocolArg::Base64 => ChannelProtocol::Base64V1,
        }
    }
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Channel index to prefix.
    #[arg(long, short = 'c', default_value = "0")]
    pub channel: u8,
    /// Wire protocol.
    #[arg(long, value_enum, default_value = "v1")]
    pub protocol: ProtocolArg,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Wire protocol.
    #[arg(long, value_enum, default_value = "v1")]
    pub protocol: ProtocolArg,
    /// Message bytes as hex.
    #[arg(long, conflicts_with = "text")]
    pub hex: Option<String>,
    /// Message as text (base64 protocol messages).
    #[arg(long, conflicts_with = "hex")]
    pub text: Option<String>,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Outbound channel to write on.
    #[arg(long, default_value = "0")]
    pub outbound: u8,
    /// Inbound channels to declare (comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "1,2")]
    pub inbound: Vec<u8>,
    /// Inbound channel the echo peer answers on.
    #[arg(long, default_value = "1")]
    pub echo_to: u8,
    /// Payload to send; repeat for several messages.
    #[arg(long, required = true)]
    pub data: Vec<String>,
    /// Wire protocol.
    #[arg(long, value_enum, default_value = "v1")]
    pub protocol: ProtocolArg,
    /// Split echoed messages into fragments of at most this many bytes.
    #[arg(long, value_name = "BYTES")]
    pub fragment_size: Option<usize>,
    /// Shutdown grace period (e.g. 100ms, 1s).
    #[arg(long, default_value = "100ms")]
    pub grace: String,
    /// Maximum time to wait for echoes (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn rejects_bad_durations() {
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("0ms").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("soon").unwrap_err().code, USAGE);
    }
}

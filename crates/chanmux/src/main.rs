mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::exit::CliResult;
use crate::logging::{init_logging, LogFormat, LogLevel, LogOptions};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "chanmux", version, about = "channel.k8s.io multiplexing CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr). RUST_LOG overrides it when set.
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Level for per-fragment and per-write events from the multiplexer
    /// pumps and the transport. Defaults to --log-level.
    #[arg(long, value_name = "LEVEL", global = true)]
    traffic_log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn log_options(&self) -> LogOptions {
        LogOptions {
            format: self.log_format,
            level: self.log_level,
            traffic: self.traffic_log_level,
        }
    }
}

fn run(cli: Cli) -> CliResult<i32> {
    init_logging(cli.log_options());
    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    cmd::run(cli.command, format)
}

fn main() {
    match run(Cli::parse()) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encode_subcommand() {
        let cli = Cli::try_parse_from([
            "chanmux",
            "encode",
            "--channel",
            "0",
            "--data",
            "ls\n",
        ])
        .expect("encode args should parse");

        assert!(matches!(cli.command, Command::Encode(_)));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "chanmux",
            "encode",
            "--data",
            "hello",
            "--file",
            "/tmp/payload.bin",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn traffic_log_level_is_global() {
        let cli = Cli::try_parse_from([
            "chanmux",
            "loopback",
            "--data",
            "x",
            "--traffic-log-level",
            "trace",
        ])
        .expect("global flag should parse after the subcommand");

        let options = cli.log_options();
        assert!(matches!(options.traffic, Some(LogLevel::Trace)));
        assert!(matches!(options.level, LogLevel::Info));
    }

    #[test]
    fn parses_loopback_channel_lists() {
        let cli = Cli::try_parse_from([
            "chanmux",
            "loopback",
            "--inbound",
            "1,2",
            "--echo-to",
            "2",
            "--data",
            "a",
            "--data",
            "b",
        ])
        .expect("loopback args should parse");

        match cli.command {
            Command::Loopback(args) => {
                assert_eq!(args.inbound, vec![1, 2]);
                assert_eq!(args.echo_to, 2);
                assert_eq!(args.data, vec!["a", "b"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::{Directive, EnvFilter};

/// Modules whose events describe individual fragments, writes and close
/// frames rather than session lifecycle.
pub const TRAFFIC_TARGETS: &[&str] = &[
    "chanmux_mux::pump",
    "chanmux_mux::inbound",
    "chanmux_mux::outbound",
    "chanmux_transport::memory",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LogOptions {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Separate level for [`TRAFFIC_TARGETS`]; `None` follows `level`.
    pub traffic: Option<LogLevel>,
}

/// Global level from `RUST_LOG` or `level`, with traffic targets
/// overridden when requested.
pub fn build_filter(level: LogLevel, traffic: Option<LogLevel>) -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();
    if let Some(traffic) = traffic {
        let traffic = LevelFilter::from(traffic);
        for target in TRAFFIC_TARGETS {
            if let Ok(directive) = format!("{target}={traffic}").parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

pub fn init_logging(options: LogOptions) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(build_filter(options.level, options.traffic))
        .with_ansi(false)
        // Targets tell pump events apart once traffic logging is on.
        .with_target(options.traffic.is_some());

    match options.format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

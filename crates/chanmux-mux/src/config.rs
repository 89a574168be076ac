use std::time::Duration;

use chanmux_frame::ChannelProtocol;

/// Default size of each receive buffer, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default time `shutdown` waits for the pumps to stop.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Configuration for a [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Size of the buffer each fragment is received into. Default: 1024.
    pub buffer_size: usize,
    /// Wire protocol. Default: `channel.k8s.io`.
    pub protocol: ChannelProtocol,
    /// Maximum unread bytes per inbound channel. `None` means unbounded.
    pub max_pending_bytes: Option<usize>,
    /// Grace period used by [`Multiplexer::shutdown_default`](crate::Multiplexer::shutdown_default).
    pub shutdown_grace: Duration,
    /// Diagnostic sink for pump events. Defaults to the dispatcher that is
    /// current when the multiplexer is constructed.
    pub dispatch: Option<tracing::Dispatch>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            protocol: ChannelProtocol::V1,
            max_pending_bytes: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            dispatch: None,
        }
    }
}

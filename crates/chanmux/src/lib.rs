//! Multiplexed channel streams over one message-oriented connection.
//!
//! chanmux carries several ordered byte streams (exec stdin/stdout/stderr,
//! port-forward data/error) over a single WebSocket-style connection that
//! speaks the Kubernetes `channel.k8s.io` sub-protocol.
//!
//! # Crate Structure
//!
//! - [`transport`]: duplex connection traits and the in-memory transport
//! - [`frame`]: channel prefix codec, protocol names, well-known indexes
//! - [`mux`]: the multiplexer and its inbound/outbound channel streams

/// Re-export transport types.
pub mod transport {
    pub use chanmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanmux_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use chanmux_mux::*;
}

pub use chanmux_mux::{InboundStream, MuxConfig, MuxError, Multiplexer, OutboundStream};

//! Channel multiplexing over one message-oriented duplex connection.
//!
//! This is the core layer of chanmux. A [`Multiplexer`] takes an open
//! connection plus the inbound and outbound channel indexes of the session
//! and exposes one ordered byte stream per index:
//! - [`InboundStream`]: messages received for the index, readable with
//!   [`tokio::io::AsyncRead`] or as a `Stream` of chunks
//! - [`OutboundStream`]: each write becomes one message, transmitted in
//!   enqueue order across all outbound streams
//!
//! Heartbeats are dropped, data for undeclared or closed channels is
//! discarded, and every pooled buffer is returned on every exit path.

pub mod buffer;
pub mod config;
pub mod error;
pub mod inbound;
pub mod multiplexer;
pub mod outbound;
pub mod pending;
mod pump;
pub mod state;

pub use buffer::{BufferPool, PoolStats, PooledBuffer};
pub use config::{MuxConfig, DEFAULT_BUFFER_SIZE, DEFAULT_SHUTDOWN_GRACE};
pub use error::{MuxError, Result};
pub use inbound::InboundStream;
pub use multiplexer::Multiplexer;
pub use outbound::OutboundStream;
pub use pending::WriteCompletion;
pub use state::MuxState;

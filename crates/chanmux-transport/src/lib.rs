//! Duplex connection abstraction for channel multiplexing.
//!
//! The multiplexer never negotiates connections itself. Callers hand it an
//! already-open, message-oriented connection (typically a WebSocket that
//! agreed on the `channel.k8s.io` sub-protocol) through the
//! [`DuplexConnection`] trait. This is the lowest layer of chanmux.
//!
//! [`memory`] provides an in-process implementation for tests and demos.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::{duplex, MemoryConfig, MemoryConnection, MemoryPeer, PeerEvent};
pub use traits::{
    CloseStatus, ConnectionState, DuplexConnection, FragmentSource, MessageKind, MessageSink,
    ReceiveResult, NORMAL_CLOSURE,
};

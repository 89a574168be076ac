//! Well-known channel indexes.
//!
//! The multiplexer routes purely by number; these constants only name the
//! indexes Kubernetes assigns for exec/attach and port-forward sessions.
//! Inbound and outbound indexes are separate namespaces, so exec `STDIN`
//! and port-forward `PORT_FORWARD_DATA` share the value 0.

/// Exec/attach standard input (client to server).
pub const STDIN: u8 = 0;

/// Exec/attach standard output (server to client).
pub const STDOUT: u8 = 1;

/// Exec/attach standard error (server to client).
pub const STDERR: u8 = 2;

/// Port-forward data stream.
pub const PORT_FORWARD_DATA: u8 = 0;

/// Port-forward error stream.
pub const PORT_FORWARD_ERROR: u8 = 1;

/// Returns a human-readable name for an exec/attach channel index.
pub fn exec_channel_name(index: u8) -> &'static str {
    match index {
        STDIN => "STDIN",
        STDOUT => "STDOUT",
        STDERR => "STDERR",
        3 => "ERROR",
        4 => "RESIZE",
        _ => "USER",
    }
}

/// Returns a human-readable name for a port-forward channel index.
pub fn port_forward_channel_name(index: u8) -> &'static str {
    match index {
        PORT_FORWARD_DATA => "DATA",
        PORT_FORWARD_ERROR => "ERROR",
        _ => "USER",
    }
}

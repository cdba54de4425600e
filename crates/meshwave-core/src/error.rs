//! Typed errors for every core/presentation boundary call.
//!
//! Each variant corresponds to one error mode in the error-handling taxonomy:
//! I/O failures, protocol violations, resource exhaustion, transfer timeout,
//! and configuration errors all get their own concrete variant rather than a
//! bare `String` or `io::Error` escaping the boundary.

use std::io;
use std::net::AddrParseError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("invalid hub address: {0}")]
    InvalidAddr(#[from] AddrParseError),
    #[error("tcp connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("hello handshake failed: {0}")]
    Hello(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SendChatError {
    #[error("not connected")]
    NotConnected,
    #[error("message too large: {len} bytes exceeds MAX_MSG ({max})")]
    TooLarge { len: usize, max: usize },
    #[error("empty recipient name")]
    EmptyRecipient,
    #[error("send failed: {0}")]
    Io(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SendFileError {
    #[error("not connected")]
    NotConnected,
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("transfer table is full")]
    TableFull,
    #[error("send failed: {0}")]
    Io(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PauseError {
    #[error("unknown transfer id {0}")]
    UnknownTransfer(u32),
    #[error("transfer {id} is not ACTIVE (state: {state:?})")]
    WrongState { id: u32, state: crate::transfer::XferState },
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("unknown transfer id {0}")]
    UnknownTransfer(u32),
    #[error("transfer {id} is not PAUSED (state: {state:?})")]
    WrongState { id: u32, state: crate::transfer::XferState },
}

#[derive(Debug, thiserror::Error)]
pub enum HubStartError {
    #[error("already running")]
    AlreadyRunning,
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("already running")]
    AlreadyRunning,
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
}

/// Protocol-level decode failures. These never cross the receive loop; a
/// frame that fails to decode is logged and discarded, per the taxonomy's
/// "protocol violations" policy.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload_len {0} exceeds the accepted bound of {1}")]
    PayloadTooLarge(u16, usize),
    #[error("missing NUL separator in payload")]
    MissingSeparator,
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated frame")]
    Truncated,
}

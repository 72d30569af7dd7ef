//! Error types for the listener and the framed pipe.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced while binding or running the socket listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no TCP addresses resolved for {host}:{port}")]
    ResolveEmpty { host: String, port: u16 },
    #[error("refusing to listen on non-loopback address {addr}")]
    NonLoopback { addr: SocketAddr },
    #[error("failed to bind TCP listener at {addr}: {source}")]
    BindTcp {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read the bound listener address: {source}")]
    LocalAddr {
        #[source]
        source: io::Error,
    },
    #[error("failed to enable non-blocking listener: {source}")]
    NonBlocking {
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn listener thread: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },
    #[error("listener thread panicked")]
    ThreadPanic,
}

/// Errors surfaced by [`FramePipe`](super::FramePipe).
#[derive(Debug, Error)]
pub enum PipeError {
    /// The peer closed or reset the connection, or the pipe was closed locally.
    #[error("connection closed")]
    Closed,
    #[error("timed out with {buffered} bytes of an incomplete frame buffered")]
    TimedOutMidFrame { buffered: usize },
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("write stalled after {written} of {total} bytes")]
    WriteStalled { written: usize, total: usize },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipeError {
    /// Maps socket errors that mean "the peer went away" onto [`Self::Closed`].
    pub(super) fn from_socket(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(error),
        }
    }
}

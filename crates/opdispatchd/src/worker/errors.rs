//! Errors that end a worker session.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use super::MemoryProbeError;
use crate::transport::PipeError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to dispatch server at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("dispatch server refused worker {worker}")]
    AuthenticationRejected { worker: usize },
    #[error("dispatch server did not answer worker {worker}'s authentication")]
    AuthenticationTimeout { worker: usize },
    #[error("protocol violation: expected {expected}, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },
    #[error(transparent)]
    Pipe(#[from] PipeError),
    #[error(transparent)]
    Memory(#[from] MemoryProbeError),
}

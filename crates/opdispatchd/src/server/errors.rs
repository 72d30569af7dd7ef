//! Errors that end a dispatch connection.

use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::operation::OperationId;
use crate::transport::PipeError;

/// Reasons a worker connection was closed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Pipe(#[from] PipeError),
    #[error("worker did not authenticate within {waited_ms} ms")]
    AuthenticationTimeout { waited_ms: u64 },
    #[error("protocol version {received} is not supported (expected {expected})")]
    ProtocolVersion { expected: u32, received: u32 },
    #[error("worker {worker} presented an invalid token")]
    InvalidToken { worker: usize },
    #[error("protocol violation: expected {expected}, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("worker {worker} did not acknowledge operation {operation} within {waited_ms} ms")]
    AcknowledgeTimeout {
        worker: usize,
        operation: OperationId,
        waited_ms: u64,
    },
    #[error("worker {worker} refused operation {operation}")]
    AcknowledgeRefused { worker: usize, operation: OperationId },
    #[error("worker {worker} did not complete operation {operation} within {waited_ms} ms")]
    ExecutionTimeout {
        worker: usize,
        operation: OperationId,
        waited_ms: u64,
    },
}

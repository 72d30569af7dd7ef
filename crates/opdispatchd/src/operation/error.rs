//! Failures reported to the submitter of an operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome error delivered to whoever submitted an operation.
///
/// Crosses the wire inside `done_operation`, so every variant is plain data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum OperationError {
    /// The operation ran and reported a failure of its own.
    #[error("operation failed: {message}")]
    Failed { message: String },
    /// The worker did not report completion in time; not retried.
    #[error("operation {kind} did not complete within {waited_ms} ms")]
    Timeout { kind: String, waited_ms: u64 },
    #[error("operation queue is full ({limit} entries)")]
    QueueFull { limit: usize },
    #[error("failed to apply operation result: {message}")]
    ResultMerge { message: String },
    #[error("failed to serialize operation: {message}")]
    Serialization { message: String },
    #[error("no executor registered for operation kind {kind}")]
    UnknownKind { kind: String },
    #[error("operation {kind} has schema {received}, expected {expected}")]
    SchemaMismatch {
        kind: String,
        expected: u32,
        received: u32,
    },
    #[error("local execution is only permitted on worker threads")]
    NotInWorker,
    #[error("no default operation queuer is installed")]
    NoQueuer,
    /// The submitter stopped waiting; remote execution is not cancelled.
    #[error("gave up waiting for the operation after {waited_ms} ms")]
    WaitTimedOut { waited_ms: u64 },
    #[error("operation panicked: {message}")]
    Panicked { message: String },
    #[error("dispatch failure: {message}")]
    Dispatch { message: String },
    /// The operation was dropped before any outcome was produced.
    #[error("operation abandoned before completion")]
    Abandoned,
}

impl OperationError {
    /// Convenience constructor for operation implementations.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub(crate) fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }
}

//! Dispatcher bookkeeping and admission errors.

use thiserror::Error;

use crate::operation::OperationError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("operation queue is full ({limit} entries)")]
    QueueFull { limit: usize },
    #[error("worker number {number} is outside the pool of {workers} workers")]
    WorkerOutOfRange { number: usize, workers: usize },
    #[error("worker {number} is already connected")]
    AlreadyConnected { number: usize },
    #[error("worker {number} generation {generation} is no longer connected")]
    StaleWorker { number: usize, generation: u64 },
    #[error("worker {number} already has an operation in flight")]
    AlreadyWorking { number: usize },
    #[error("a supervisor is already attached")]
    SupervisorAlreadySet,
    #[error("dispatcher state lock poisoned")]
    Poisoned,
}

impl From<DispatchError> for OperationError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::QueueFull { limit } => Self::QueueFull { limit },
            other => Self::dispatch(other.to_string()),
        }
    }
}

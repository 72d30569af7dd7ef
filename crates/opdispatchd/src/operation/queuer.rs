//! Submission seam between producers and the dispatcher.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::{OperationEnvelope, OperationError, OperationId, ResultRecord};

/// A submitted operation with its notification target, type-erased so the
/// dispatcher can hold operations of every kind in one queue.
pub trait QueuedOperation: Send {
    fn id(&self) -> OperationId;

    fn kind(&self) -> &'static str;

    /// Runs the operation's pre-dispatch hook in the submitting process.
    fn before_remote_execution(&mut self) -> Result<(), OperationError>;

    fn envelope(&self) -> Result<OperationEnvelope, OperationError>;

    /// Records the outcome, decoding a successful result into the
    /// operation's output type.
    fn settle(&mut self, outcome: Result<ResultRecord, OperationError>);

    /// Delivers the settled outcome to the notification target.
    fn notify(self: Box<Self>);

    /// Drops the submission without notifying anyone. Used when admission
    /// fails and the error is returned to the submitter directly.
    fn discard(self: Box<Self>);
}

/// Accepts operations for dispatch.
pub trait OpQueuer: Send + Sync {
    fn queue_operation(&self, operation: Box<dyn QueuedOperation>) -> Result<(), OperationError>;
}

static DEFAULT_QUEUER: OnceCell<Arc<dyn OpQueuer>> = OnceCell::new();

/// Installs the process-wide queuer used by the `*_with_default_queuer`
/// methods. Returns `false` if one was already installed.
pub fn set_default_queuer(queuer: Arc<dyn OpQueuer>) -> bool {
    DEFAULT_QUEUER.set(queuer).is_ok()
}

pub(crate) fn default_queuer() -> Result<&'static Arc<dyn OpQueuer>, OperationError> {
    DEFAULT_QUEUER.get().ok_or(OperationError::NoQueuer)
}

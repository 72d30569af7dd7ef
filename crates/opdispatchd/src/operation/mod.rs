//! Units of work offloaded from the dispatching process to workers.
//!
//! An [`Operation`] is a serializable value plus the code that performs it.
//! Producers submit operations through an [`OpQueuer`], usually the
//! dispatcher's per-application queuer, and either block for the outcome
//! ([`Operation::perform`]) or receive it through a [`NotifyTarget`]
//! ([`Operation::perform_in_background`]). Workers decode operations with an
//! [`OperationRegistry`] and send back a [`ResultRecord`] holding the
//! operation's [`Operation::Output`].

pub mod builtin;
mod envelope;
mod error;
mod local;
mod notify;
mod queuer;
mod registry;
#[cfg(test)]
mod tests;

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use self::envelope::{OperationEnvelope, OperationId, ResultRecord};
pub use self::error::OperationError;
pub use self::local::{is_worker_thread, mark_thread_as_worker, unmark_thread_as_worker};
pub(crate) use self::local::WorkerThreadGuard;
pub use self::notify::NotifyTarget;
pub(crate) use self::notify::duration_millis;
use self::notify::{Submission, Waiter};
pub use self::queuer::{OpQueuer, QueuedOperation, set_default_queuer};
use self::queuer::default_queuer;
pub use self::registry::{OperationRegistry, RegistryError};

pub(crate) const OPERATION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::operation");

/// A unit of work that can run in a worker process.
pub trait Operation: Serialize + DeserializeOwned + Send + 'static {
    /// Stable tag identifying the operation type on the wire.
    const KIND: &'static str;

    /// Bumped whenever the serialized shape of the operation changes.
    const SCHEMA_VERSION: u32 = 1;

    /// Data the worker sends back on success.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Does the work. Runs on a worker thread.
    fn perform_operation(&mut self) -> Result<Self::Output, OperationError>;

    /// Runs in the dispatching process before each dispatch attempt. An
    /// error becomes the operation's outcome and is not retried.
    fn before_remote_execution(&mut self) -> Result<(), OperationError> {
        Ok(())
    }

    /// Submits the operation and blocks until it completes.
    fn perform(self, queuer: &dyn OpQueuer) -> Result<Self::Output, OperationError> {
        let waiter = Waiter::<Self>::new();
        queuer.queue_operation(Submission::boxed(self, waiter.target()))?;
        waiter.wait(None)
    }

    /// As [`Self::perform`], but stops waiting after `timeout`. The remote
    /// execution carries on regardless.
    fn perform_with_timeout(
        self,
        queuer: &dyn OpQueuer,
        timeout: Duration,
    ) -> Result<Self::Output, OperationError> {
        let waiter = Waiter::<Self>::new();
        queuer.queue_operation(Submission::boxed(self, waiter.target()))?;
        waiter.wait(Some(timeout))
    }

    /// Submits through the queuer installed with [`set_default_queuer`].
    fn perform_with_default_queuer(self) -> Result<Self::Output, OperationError> {
        let queuer = default_queuer()?;
        self.perform(queuer.as_ref())
    }

    /// Submits the operation without blocking. `target` is told the outcome.
    ///
    /// An admission failure is returned directly and `target` is not
    /// notified.
    fn perform_in_background(
        self,
        queuer: &dyn OpQueuer,
        target: Box<dyn NotifyTarget<Self>>,
    ) -> Result<(), OperationError> {
        queuer.queue_operation(Submission::boxed(self, target))
    }

    fn perform_in_background_with_default_queuer(
        self,
        target: Box<dyn NotifyTarget<Self>>,
    ) -> Result<(), OperationError> {
        let queuer = default_queuer()?;
        self.perform_in_background(queuer.as_ref(), target)
    }

    /// Runs the operation on the current thread, which must be a worker
    /// thread. Lets operations compose sub-operations.
    fn perform_locally(&mut self) -> Result<Self::Output, OperationError> {
        if !is_worker_thread() {
            return Err(OperationError::NotInWorker);
        }
        self.perform_operation()
    }
}

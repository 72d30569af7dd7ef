//! Strategies for starting and restarting worker processes.
//!
//! The dispatcher only tells its supervisor when supervision starts and
//! when a worker has failed. Restarting is the supervisor's business; a
//! replacement worker reconnects and authenticates with the same number.

mod process;
mod thread;

pub use self::process::{ProcessSupervisor, ProcessSupervisorError};
pub use self::thread::{ThreadSupervisor, WorkerFactory, WorkerFailureLog};

use crate::dispatcher::Policy;

pub(crate) const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Keeps one worker running per slot.
pub trait WorkerSupervisor: Send + Sync {
    /// Starts one worker for every slot in `policy`.
    fn start_supervision(&self, policy: &Policy);

    /// The worker in slot `worker_number` stopped responding and has been
    /// disconnected. A replacement should eventually connect.
    fn worker_failed(&self, worker_number: usize);

    /// Stops every supervised worker.
    fn shutdown(&self) {}
}

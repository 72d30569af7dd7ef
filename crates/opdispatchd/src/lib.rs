//! Operation dispatch and worker supervision.
//!
//! Producer threads describe units of work as [`Operation`] values and
//! submit them through an [`OpQueuer`]. The [`Dispatcher`] queues them,
//! enforces a per-application ceiling on concurrently running operations and
//! bounds the queue. Workers, usually separate `opworker` processes, connect
//! to the dispatch server over loopback TCP, authenticate with their slot
//! number and a shared token, and execute operations one at a time.
//!
//! The dispatch server hands each operation to an idle worker and waits for
//! an acknowledgement. A worker that does not acknowledge in time is failed
//! and the operation is put back at the head of the queue, so the producer
//! never sees the hiccup. A worker that acknowledges but does not finish in
//! time is failed and the producer receives [`OperationError::Timeout`].
//!
//! Workers keep an eye on their own memory. Once resident memory has grown
//! past a configured percentage of the startup baseline, a worker announces
//! that it will exit together with its last result, and its supervisor starts
//! a fresh process in the same slot.
//!
//! [`DispatchService`] wires the pieces together from an
//! [`opdispatch_config::Config`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use opdispatch_config::Config;
//! use opdispatchd::operation::builtin::Echo;
//! use opdispatchd::{DispatchService, Operation, StructuredHealthReporter, SupervisorKind};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = DispatchService::start(
//!     Config::default(),
//!     SupervisorKind::Process,
//!     Arc::new(StructuredHealthReporter::new()),
//! )?;
//! let queuer = service.queuer("billing");
//! let reply = Echo::new("hello").perform(&queuer)?;
//! assert_eq!(reply, "hello");
//! service.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
mod health;
pub mod operation;
mod process;
pub mod protocol;
pub mod server;
mod service;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use dispatcher::{ApplicationId, ApplicationQueuer, DispatchError, Dispatcher, Policy};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use operation::{
    NotifyTarget, OpQueuer, Operation, OperationError, OperationRegistry, set_default_queuer,
};
pub use process::{
    LaunchError, MarkerStatus, ReadinessMarker, ReadinessSnapshot, run_worker, run_worker_with,
};
pub use service::{
    ConfigLoader, DispatchService, ServiceError, StaticConfigLoader, SupervisorFactory,
    SupervisorKind, SystemConfigLoader,
};
pub use supervisor::{ProcessSupervisor, ThreadSupervisor, WorkerSupervisor};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use worker::{WorkerExit, WorkerProcess};

#[cfg(test)]
mod tests;

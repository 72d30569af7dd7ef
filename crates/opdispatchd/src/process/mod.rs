//! Process-level plumbing for the `opworker` binary: argument handling,
//! the readiness marker and the launch sequence.

mod errors;
mod files;
mod launch;
mod readiness;

pub use self::errors::LaunchError;
pub use self::launch::{run_worker, run_worker_with};
pub use self::readiness::{MarkerStatus, ReadinessMarker, ReadinessSnapshot};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

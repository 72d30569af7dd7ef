//! Launch sequence of the `opworker` binary.

use std::ffi::OsString;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use ortho_config::OrthoConfig;
use tracing::{info, warn};

use opdispatch_config::{Config, RuntimePaths};

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::readiness::{MarkerStatus, ReadinessMarker};
use crate::operation::OperationRegistry;
use crate::telemetry;
use crate::worker::{WorkerExit, WorkerProcess};

const PROGRAM_NAME: &str = "opworker";

/// Runs one worker session from command-line arguments.
///
/// The first argument after the program name is the worker number; any
/// further arguments are configuration flags. Everything else comes from
/// `OPDISPATCH_*` environment variables set by the supervisor. The worker
/// executes the built-in operations.
pub fn run_worker<I>(args: I) -> Result<WorkerExit, LaunchError>
where
    I: IntoIterator<Item = OsString>,
{
    run_worker_with(args, Arc::new(OperationRegistry::with_builtins()))
}

/// Like [`run_worker`], executing the operations in `registry`.
///
/// Applications with their own operation kinds build a worker binary that
/// registers them and calls this from `main`.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use opdispatchd::{OperationRegistry, run_worker_with};
///
/// let registry = OperationRegistry::with_builtins();
/// // Register application operations on `registry` here.
/// let _exit = run_worker_with(std::env::args_os(), Arc::new(registry));
/// ```
pub fn run_worker_with<I>(args: I, registry: Arc<OperationRegistry>) -> Result<WorkerExit, LaunchError>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let program = args.next().unwrap_or_else(|| OsString::from(PROGRAM_NAME));
    let worker = parse_worker_number(args.next())?;
    let config_args: Vec<OsString> = std::iter::once(program).chain(args).collect();
    let config = Config::load_from_iter(config_args)?;
    launch_with(&config, worker, registry)
}

/// Runs one worker session with an already resolved configuration.
pub(crate) fn launch_with(
    config: &Config,
    worker: usize,
    registry: Arc<OperationRegistry>,
) -> Result<WorkerExit, LaunchError> {
    config.validate()?;
    telemetry::initialise(config)?;
    let token = config.auth_token.clone().ok_or(LaunchError::MissingToken)?;
    let addr = resolve_dispatch_address(config)?;
    let paths = RuntimePaths::from_config(config)?;

    let marker = Arc::new(ReadinessMarker::new(paths.worker_health_path(worker), worker));
    marker.write(MarkerStatus::Starting)?;
    info!(
        target: PROCESS_TARGET,
        worker,
        pid = std::process::id(),
        addr = %addr,
        "worker process starting"
    );

    let ready = Arc::clone(&marker);
    let mut session = WorkerProcess::new(worker, addr, token, registry)
        .with_memory_growth_limit(config.memory_growth_threshold())
        .with_ready_hook(move || {
            if let Err(error) = ready.write(MarkerStatus::Ready) {
                warn!(target: PROCESS_TARGET, error = %error, "failed to mark worker ready");
            }
        });
    let outcome = session.run();
    drop(session);

    if let Err(error) = marker.write(MarkerStatus::Stopping) {
        warn!(target: PROCESS_TARGET, error = %error, "failed to mark worker stopping");
    }
    match &outcome {
        Ok(exit) => info!(target: PROCESS_TARGET, worker, exit = ?exit, "worker process exiting"),
        Err(error) => warn!(target: PROCESS_TARGET, worker, error = %error, "worker process failed"),
    }
    outcome.map_err(LaunchError::from)
}

fn parse_worker_number(argument: Option<OsString>) -> Result<usize, LaunchError> {
    let value = argument.ok_or(LaunchError::MissingWorkerNumber)?;
    let value = value.to_string_lossy().into_owned();
    value
        .trim()
        .parse::<usize>()
        .map_err(|source| LaunchError::InvalidWorkerNumber { value, source })
}

fn resolve_dispatch_address(config: &Config) -> Result<SocketAddr, LaunchError> {
    let (host, port) = config.dispatch_address();
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| LaunchError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    addrs.next().ok_or_else(|| LaunchError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })
}

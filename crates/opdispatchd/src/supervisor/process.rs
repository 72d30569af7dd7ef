//! Supervisor that runs each worker as an `opworker` child process.
//!
//! Children learn the dispatch address, the token and the logging and memory
//! policy through `OPDISPATCH_*` environment variables, the same layer
//! [`Config`] reads on their side. A monitor thread reaps exited children and
//! starts replacements, backing off when a spawn fails; a failed worker is
//! killed so the monitor replaces it.

use std::env;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use opdispatch_config::{Config, ENV_PREFIX, RuntimePaths, RuntimePathsError};
use thiserror::Error;
use tracing::{info, warn};

use super::{SUPERVISOR_TARGET, WorkerSupervisor};
use crate::dispatcher::Policy;
use crate::health::HealthReporter;
use crate::operation::duration_millis;

const MONITOR_INTERVAL: Duration = Duration::from_millis(250);
const MAX_LAUNCH_BACKOFF: Duration = Duration::from_secs(30);
const WORKER_BINARY: &str = "opworker";

/// Errors raised while preparing or starting worker processes.
#[derive(Debug, Error)]
pub enum ProcessSupervisorError {
    /// The shared runtime directory could not be prepared.
    #[error(transparent)]
    Runtime(#[from] RuntimePathsError),
    /// Spawning a worker process failed.
    #[error("failed to launch worker {worker} from '{}': {source}", .program.to_string_lossy())]
    Launch {
        worker: usize,
        program: OsString,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Default)]
struct Slot {
    child: Option<Child>,
    launches: usize,
    failed_launches: u32,
    retry_at: Option<Instant>,
}

impl Slot {
    fn backing_off(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|retry_at| now < retry_at)
    }
}

/// Delay before the next launch after `failures` consecutive spawn failures.
///
/// Doubles from the monitor interval and stops growing at
/// [`MAX_LAUNCH_BACKOFF`].
fn launch_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    MONITOR_INTERVAL
        .saturating_mul(1_u32 << doublings)
        .min(MAX_LAUNCH_BACKOFF)
}

struct Shared {
    program: OsString,
    environment: Vec<(String, String)>,
    reporter: Arc<dyn HealthReporter>,
    slots: Mutex<Vec<Slot>>,
    stop: AtomicBool,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn launch(&self, worker: usize) -> Result<Child, ProcessSupervisorError> {
        self.reporter.worker_restart_requested(worker);
        let mut command = Command::new(&self.program);
        command
            .arg(worker.to_string())
            .envs(self.environment.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
            .spawn()
            .map_err(|source| ProcessSupervisorError::Launch {
                worker,
                program: self.program.clone(),
                source,
            })
    }

    fn fill_slot(&self, worker: usize, slot: &mut Slot) {
        slot.launches += 1;
        match self.launch(worker) {
            Ok(child) => {
                info!(
                    target: SUPERVISOR_TARGET,
                    worker,
                    pid = child.id(),
                    "worker process launched"
                );
                slot.child = Some(child);
                slot.failed_launches = 0;
                slot.retry_at = None;
            }
            Err(error) => {
                slot.failed_launches = slot.failed_launches.saturating_add(1);
                let backoff = launch_backoff(slot.failed_launches);
                slot.retry_at = Some(Instant::now() + backoff);
                warn!(
                    target: SUPERVISOR_TARGET,
                    worker,
                    attempt = slot.failed_launches,
                    retry_in_ms = duration_millis(backoff),
                    error = %error,
                    "worker process launch failed"
                );
            }
        }
    }

    fn reap_and_refill(&self) {
        let mut slots = self.slots();
        for (worker, slot) in slots.iter_mut().enumerate() {
            if let Some(child) = slot.child.as_mut() {
                match child.try_wait() {
                    Ok(None) => continue,
                    Ok(Some(status)) => info!(
                        target: SUPERVISOR_TARGET,
                        worker,
                        status = %status,
                        "worker process exited"
                    ),
                    Err(error) => warn!(
                        target: SUPERVISOR_TARGET,
                        worker,
                        error = %error,
                        "failed to poll worker process"
                    ),
                }
                slot.child = None;
            }
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            if slot.backing_off(Instant::now()) {
                continue;
            }
            self.fill_slot(worker, slot);
        }
    }
}

fn terminate(worker: usize, mut child: Child) {
    if let Err(error) = child.kill() {
        warn!(
            target: SUPERVISOR_TARGET,
            worker,
            error = %error,
            "failed to kill worker process"
        );
    }
    if let Err(error) = child.wait() {
        warn!(
            target: SUPERVISOR_TARGET,
            worker,
            error = %error,
            "failed to reap worker process"
        );
    }
}

/// Keeps one `opworker` process alive per slot.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Builds a supervisor for workers that should reach the dispatch server
    /// at `addr` and present `token`.
    ///
    /// The program is `worker_program` when configured, otherwise the
    /// `opworker` binary installed next to the running executable.
    pub fn from_config(
        config: &Config,
        addr: SocketAddr,
        token: &str,
        reporter: Arc<dyn HealthReporter>,
    ) -> Result<Self, ProcessSupervisorError> {
        let paths = RuntimePaths::from_config(config)?;
        let program = resolve_worker_program(config.worker_program.as_deref());
        let environment = worker_environment(config, addr, token, &paths);
        Ok(Self::with_program(program, environment, reporter))
    }

    /// Builds a supervisor that launches `program` with the given
    /// environment. The worker number is passed as the only argument.
    #[must_use]
    pub fn with_program(
        program: impl Into<OsString>,
        environment: Vec<(String, String)>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                program: program.into(),
                environment,
                reporter,
                slots: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Number of launch attempts made for a slot.
    #[must_use]
    pub fn launches(&self, worker: usize) -> usize {
        self.shared.slots().get(worker).map_or(0, |slot| slot.launches)
    }

    /// Process id of the running worker for a slot.
    #[must_use]
    pub fn worker_pid(&self, worker: usize) -> Option<u32> {
        self.shared
            .slots()
            .get(worker)
            .and_then(|slot| slot.child.as_ref().map(Child::id))
    }
}

impl WorkerSupervisor for ProcessSupervisor {
    fn start_supervision(&self, policy: &Policy) {
        {
            let mut slots = self.shared.slots();
            slots.clear();
            slots.resize_with(policy.workers(), Slot::default);
            for (worker, slot) in slots.iter_mut().enumerate() {
                self.shared.fill_slot(worker, slot);
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("opdispatch-supervisor".to_string())
            .spawn(move || {
                while !shared.stop.load(Ordering::SeqCst) {
                    thread::sleep(MONITOR_INTERVAL);
                    shared.reap_and_refill();
                }
            });
        match spawned {
            Ok(handle) => {
                let mut monitor = match self.monitor.lock() {
                    Ok(monitor) => monitor,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *monitor = Some(handle);
            }
            Err(error) => warn!(
                target: SUPERVISOR_TARGET,
                error = %error,
                "failed to spawn supervisor monitor; workers will not be restarted"
            ),
        }
        info!(
            target: SUPERVISOR_TARGET,
            workers = policy.workers(),
            program = %self.shared.program.to_string_lossy(),
            "process supervision started"
        );
    }

    fn worker_failed(&self, worker_number: usize) {
        let child = self
            .shared
            .slots()
            .get_mut(worker_number)
            .and_then(|slot| slot.child.take());
        if let Some(child) = child {
            warn!(
                target: SUPERVISOR_TARGET,
                worker = worker_number,
                pid = child.id(),
                "killing failed worker process"
            );
            terminate(worker_number, child);
        }
    }

    fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let monitor = match self.monitor.lock() {
            Ok(mut monitor) => monitor.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = monitor
            && handle.join().is_err()
        {
            warn!(target: SUPERVISOR_TARGET, "supervisor monitor panicked");
        }
        let children: Vec<_> = self
            .shared
            .slots()
            .iter_mut()
            .enumerate()
            .filter_map(|(worker, slot)| slot.child.take().map(|child| (worker, child)))
            .collect();
        for (worker, child) in children {
            terminate(worker, child);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("program", &self.shared.program)
            .finish_non_exhaustive()
    }
}

fn resolve_worker_program(configured: Option<&str>) -> OsString {
    if let Some(program) = configured.filter(|program| !program.trim().is_empty()) {
        return OsString::from(program);
    }
    env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(WORKER_BINARY))
        .filter(|candidate| candidate.is_file())
        .map_or_else(|| OsString::from(WORKER_BINARY), PathBuf::into_os_string)
}

fn env_key(field: &str) -> String {
    format!("{ENV_PREFIX}_{field}")
}

/// Environment that makes an `opworker` child resolve the same settings as
/// the dispatcher.
fn worker_environment(
    config: &Config,
    addr: SocketAddr,
    token: &str,
    paths: &RuntimePaths,
) -> Vec<(String, String)> {
    vec![
        (env_key("DISPATCH_HOST"), addr.ip().to_string()),
        (env_key("DISPATCH_PORT"), addr.port().to_string()),
        (env_key("AUTH_TOKEN"), token.to_string()),
        (env_key("LOG_FILTER"), config.log_filter.clone()),
        (env_key("LOG_FORMAT"), config.log_format.to_string()),
        (
            env_key("MEMORY_GROWTH_PERCENT"),
            config.memory_growth_percent.to_string(),
        ),
        (
            env_key("RUNTIME_DIR"),
            paths.runtime_dir().to_string_lossy().into_owned(),
        ),
    ]
}

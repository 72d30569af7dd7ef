//! In-process supervisor that runs workers on host threads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use super::{SUPERVISOR_TARGET, WorkerSupervisor};
use crate::dispatcher::Policy;
use crate::health::HealthReporter;
use crate::operation::OperationRegistry;
use crate::worker::{WorkerExit, WorkerProcess};

const RESTART_BACKOFF: Duration = Duration::from_millis(100);

/// Builds the worker session for a slot number.
pub type WorkerFactory = Arc<dyn Fn(usize) -> WorkerProcess + Send + Sync>;

/// Failure reports received from the dispatcher, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct WorkerFailureLog {
    failures: Arc<Mutex<Vec<usize>>>,
}

impl WorkerFailureLog {
    fn record(&self, worker: usize) {
        match self.failures.lock() {
            Ok(mut failures) => failures.push(worker),
            Err(poisoned) => poisoned.into_inner().push(worker),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<usize> {
        match self.failures.lock() {
            Ok(failures) => failures.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Runs every worker slot as a loop of [`WorkerProcess`] sessions on its own
/// thread. A session that ends for any reason is followed by a new one.
///
/// Used for tests and for embedding the dispatcher without child processes.
/// A thread cannot be killed, so a worker stuck inside an operation is only
/// replaced once that operation returns.
pub struct ThreadSupervisor {
    factory: WorkerFactory,
    reporter: Arc<dyn HealthReporter>,
    stop: Arc<AtomicBool>,
    failures: WorkerFailureLog,
    sessions: Mutex<Vec<Arc<AtomicUsize>>>,
    hosts: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadSupervisor {
    /// Supervisor whose workers use `registry` and the default timings.
    pub fn new(
        addr: SocketAddr,
        token: impl Into<String>,
        registry: Arc<OperationRegistry>,
        memory_growth_percent: Option<u32>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        let token = token.into();
        let factory: WorkerFactory = Arc::new(move |number| {
            WorkerProcess::new(number, addr, token.clone(), Arc::clone(&registry))
                .with_memory_growth_limit(memory_growth_percent)
        });
        Self::with_factory(factory, reporter)
    }

    #[must_use]
    pub fn with_factory(factory: WorkerFactory, reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            factory,
            reporter,
            stop: Arc::new(AtomicBool::new(false)),
            failures: WorkerFailureLog::default(),
            sessions: Mutex::new(Vec::new()),
            hosts: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failures(&self) -> WorkerFailureLog {
        self.failures.clone()
    }

    /// Number of sessions started so far for a slot.
    #[must_use]
    pub fn sessions_started(&self, worker: usize) -> usize {
        let sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .get(worker)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }

    fn spawn_host(&self, number: usize, sessions: Arc<AtomicUsize>) -> std::io::Result<JoinHandle<()>> {
        let factory = Arc::clone(&self.factory);
        let reporter = Arc::clone(&self.reporter);
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name(format!("opworker-{number}"))
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    reporter.worker_restart_requested(number);
                    sessions.fetch_add(1, Ordering::SeqCst);
                    let mut worker = factory(number).with_stop_signal(Arc::clone(&stop));
                    match worker.run() {
                        Ok(WorkerExit::Stopped) => break,
                        Ok(exit) => info!(
                            target: SUPERVISOR_TARGET,
                            worker = number,
                            exit = ?exit,
                            "worker session ended"
                        ),
                        Err(error) => warn!(
                            target: SUPERVISOR_TARGET,
                            worker = number,
                            error = %error,
                            "worker session failed"
                        ),
                    }
                    thread::sleep(RESTART_BACKOFF);
                }
            })
    }
}

impl WorkerSupervisor for ThreadSupervisor {
    fn start_supervision(&self, policy: &Policy) {
        let counters: Vec<_> = (0..policy.workers())
            .map(|_| Arc::new(AtomicUsize::new(0)))
            .collect();
        let mut hosts = Vec::with_capacity(counters.len());
        for (number, counter) in counters.iter().enumerate() {
            match self.spawn_host(number, Arc::clone(counter)) {
                Ok(host) => hosts.push(host),
                Err(error) => warn!(
                    target: SUPERVISOR_TARGET,
                    worker = number,
                    error = %error,
                    "failed to spawn worker host thread"
                ),
            }
        }
        match self.sessions.lock() {
            Ok(mut sessions) => *sessions = counters,
            Err(poisoned) => *poisoned.into_inner() = counters,
        }
        match self.hosts.lock() {
            Ok(mut existing) => existing.extend(hosts),
            Err(poisoned) => poisoned.into_inner().extend(hosts),
        }
        info!(target: SUPERVISOR_TARGET, workers = policy.workers(), "thread supervision started");
    }

    fn worker_failed(&self, worker_number: usize) {
        warn!(
            target: SUPERVISOR_TARGET,
            worker = worker_number,
            "worker reported failed, session will be replaced"
        );
        self.failures.record(worker_number);
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let hosts = match self.hosts.lock() {
            Ok(mut hosts) => std::mem::take(&mut *hosts),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for host in hosts {
            if host.join().is_err() {
                warn!(target: SUPERVISOR_TARGET, "worker host thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSupervisor")
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

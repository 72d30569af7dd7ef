//! Worker side of the dispatch protocol.
//!
//! A worker connects to the dispatch server, authenticates with its slot
//! number and the shared token, then executes operations one at a time. After
//! each operation it compares its resident memory with the baseline taken at
//! startup and, once growth passes the configured percentage, tells the
//! server it will exit and returns so its supervisor can start a fresh one.

mod errors;
mod memory;

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use self::errors::WorkerError;
pub use self::memory::{MemoryProbe, MemoryProbeError, SysinfoMemoryProbe, grew_beyond};
use crate::operation::{OperationRegistry, WorkerThreadGuard};
use crate::protocol::{PROTOCOL_VERSION, WireMessage};
use crate::transport::{FramePipe, PipeError};

pub(crate) const WORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::worker");

/// Granularity at which a stoppable worker checks its stop flag while idle.
const STOP_POLL: Duration = Duration::from_millis(250);

/// Deadlines and retry limits on the worker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimings {
    /// Retries after the first failed connection attempt.
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub authenticate: Duration,
    /// Receive timeout while waiting for an operation.
    pub idle_wait: Duration,
    /// Pause after announcing an exit so the reply is flushed first.
    pub exit_pause: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            connect_retries: 20,
            connect_retry_delay: Duration::from_secs(1),
            authenticate: Duration::from_secs(1),
            idle_wait: Duration::from_secs(5 * 60),
            exit_pause: Duration::from_millis(250),
        }
    }
}

/// Why a worker session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Memory grew past the limit; the worker announced its exit.
    MemoryGrowth,
    /// The server closed the connection while the worker was idle.
    Disconnected,
    /// The stop signal was raised.
    Stopped,
}

/// One worker session: connect, authenticate, execute until exit.
pub struct WorkerProcess {
    number: usize,
    addr: SocketAddr,
    token: String,
    registry: Arc<OperationRegistry>,
    probe: Box<dyn MemoryProbe>,
    memory_growth_percent: Option<u32>,
    timings: WorkerTimings,
    stop: Option<Arc<AtomicBool>>,
    on_ready: Option<Box<dyn FnMut() + Send>>,
}

impl WorkerProcess {
    pub fn new(
        number: usize,
        addr: SocketAddr,
        token: impl Into<String>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            number,
            addr,
            token: token.into(),
            registry,
            probe: Box::new(SysinfoMemoryProbe::new()),
            memory_growth_percent: Some(opdispatch_config::DEFAULT_MEMORY_GROWTH_PERCENT),
            timings: WorkerTimings::default(),
            stop: None,
            on_ready: None,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Sets the growth limit in percent; `None` disables memory restarts.
    #[must_use]
    pub fn with_memory_growth_limit(mut self, percent: Option<u32>) -> Self {
        self.memory_growth_percent = percent;
        self
    }

    #[must_use]
    pub fn with_timings(mut self, timings: WorkerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Makes the worker return [`WorkerExit::Stopped`] once `stop` is set.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Runs `hook` each time the worker has authenticated and is ready for
    /// operations.
    #[must_use]
    pub fn with_ready_hook(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }

    /// Runs the session on the calling thread.
    pub fn run(&mut self) -> Result<WorkerExit, WorkerError> {
        let _worker_thread = WorkerThreadGuard::enter();
        let Some(mut pipe) = self.connect()? else {
            return Ok(WorkerExit::Stopped);
        };
        let outcome = self.serve(&mut pipe);
        pipe.close();
        outcome
    }

    fn serve(&mut self, pipe: &mut FramePipe) -> Result<WorkerExit, WorkerError> {
        self.authenticate(pipe)?;
        let baseline = self.probe.resident_bytes()?;
        info!(
            target: WORKER_TARGET,
            worker = self.number,
            baseline_bytes = baseline,
            growth_limit_percent = ?self.memory_growth_percent,
            "authenticated, waiting for operations"
        );
        if let Some(hook) = self.on_ready.as_mut() {
            hook();
        }

        loop {
            if self.stop_requested() {
                return Ok(WorkerExit::Stopped);
            }
            let message = match pipe.receive::<WireMessage>(self.receive_slice()) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(PipeError::Closed) => {
                    info!(target: WORKER_TARGET, worker = self.number, "server closed the connection");
                    return Ok(WorkerExit::Disconnected);
                }
                Err(error) => return Err(error.into()),
            };
            let WireMessage::DoOperation { operation } = message else {
                return Err(WorkerError::UnexpectedMessage {
                    expected: "do_operation",
                    received: message.name(),
                });
            };
            pipe.send(&WireMessage::AcknowledgeOperation { ok: true })?;

            debug!(
                target: WORKER_TARGET,
                worker = self.number,
                operation = %operation.id,
                kind = %operation.kind,
                "starting operation"
            );
            let outcome = self.registry.execute(&operation);
            if let Err(error) = &outcome {
                warn!(
                    target: WORKER_TARGET,
                    worker = self.number,
                    operation = %operation.id,
                    kind = %operation.kind,
                    error = %error,
                    "operation failed"
                );
            }

            let will_exit = self.memory_exceeded(baseline);
            pipe.send(&WireMessage::done(outcome, will_exit))?;
            if will_exit {
                thread::sleep(self.timings.exit_pause);
                return Ok(WorkerExit::MemoryGrowth);
            }
        }
    }

    /// Connects with retries. Returns `None` if stopped while retrying.
    fn connect(&self) -> Result<Option<FramePipe>, WorkerError> {
        let mut retries_left = self.timings.connect_retries;
        loop {
            match TcpStream::connect(self.addr) {
                Ok(stream) => {
                    info!(target: WORKER_TARGET, worker = self.number, addr = %self.addr, "connected");
                    return Ok(Some(FramePipe::new(stream)?));
                }
                Err(error) if retries_left > 0 && is_retryable(&error) => {
                    retries_left -= 1;
                    info!(
                        target: WORKER_TARGET,
                        worker = self.number,
                        retries_left,
                        error = %error,
                        "connection attempt failed"
                    );
                    thread::sleep(self.timings.connect_retry_delay);
                    if self.stop_requested() {
                        return Ok(None);
                    }
                }
                Err(source) => {
                    return Err(WorkerError::Connect {
                        addr: self.addr,
                        source,
                    });
                }
            }
        }
    }

    fn authenticate(&self, pipe: &mut FramePipe) -> Result<(), WorkerError> {
        pipe.send(&WireMessage::Authenticate {
            protocol_version: PROTOCOL_VERSION,
            worker_number: self.number,
            token: self.token.clone(),
        })?;
        match pipe.receive::<WireMessage>(self.timings.authenticate)? {
            Some(WireMessage::AuthenticateAccepted { accepted: true }) => Ok(()),
            Some(WireMessage::AuthenticateAccepted { accepted: false }) => {
                Err(WorkerError::AuthenticationRejected {
                    worker: self.number,
                })
            }
            Some(message) => Err(WorkerError::UnexpectedMessage {
                expected: "authenticate_accepted",
                received: message.name(),
            }),
            None => Err(WorkerError::AuthenticationTimeout {
                worker: self.number,
            }),
        }
    }

    fn memory_exceeded(&mut self, baseline: u64) -> bool {
        let Some(percent) = self.memory_growth_percent else {
            return false;
        };
        match self.probe.resident_bytes() {
            Ok(current) => {
                let exceeded = grew_beyond(baseline, current, percent);
                debug!(
                    target: WORKER_TARGET,
                    worker = self.number,
                    baseline_bytes = baseline,
                    current_bytes = current,
                    exceeded,
                    "memory sampled"
                );
                if exceeded {
                    info!(
                        target: WORKER_TARGET,
                        worker = self.number,
                        "memory grew past the limit, will exit after replying"
                    );
                }
                exceeded
            }
            Err(error) => {
                warn!(target: WORKER_TARGET, worker = self.number, error = %error, "memory sample failed");
                false
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::SeqCst))
    }

    fn receive_slice(&self) -> Duration {
        if self.stop.is_some() {
            self.timings.idle_wait.min(STOP_POLL)
        } else {
            self.timings.idle_wait
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("number", &self.number)
            .field("addr", &self.addr)
            .field("memory_growth_percent", &self.memory_growth_percent)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    )
}

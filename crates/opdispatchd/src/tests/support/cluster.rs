//! A dispatcher, its listener and thread-hosted workers wired together with
//! short protocol deadlines.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::dispatcher::{Dispatcher, Policy};
use crate::health::HealthReporter;
use crate::operation::OperationRegistry;
use crate::protocol::{PROTOCOL_VERSION, WireMessage};
use crate::server::{DispatchConnectionHandler, ProtocolTimings};
use crate::supervisor::{ThreadSupervisor, WorkerFactory, WorkerSupervisor};
use crate::transport::{FramePipe, ListenerHandle, PipeError, SocketListener};
use crate::worker::{MemoryProbe, WorkerProcess, WorkerTimings};

use super::{RecordingHealthReporter, ScriptedProbe};

pub(crate) const TOKEN: &str = "cluster-secret";

/// Builds the memory probe for a new session of a worker.
pub(crate) type ProbeFactory = Arc<dyn Fn(usize) -> Box<dyn MemoryProbe> + Send + Sync>;

/// Probes whose readings never change.
pub(crate) fn steady_probes() -> ProbeFactory {
    Arc::new(|_| Box::new(ScriptedProbe::new([1024])))
}

pub(crate) fn protocol_timings() -> ProtocolTimings {
    ProtocolTimings {
        authenticate: Duration::from_secs(2),
        acknowledge: Duration::from_millis(300),
        execution: Duration::from_millis(800),
        idle_poll_unit: Duration::from_millis(50),
    }
}

pub(crate) fn worker_timings() -> WorkerTimings {
    WorkerTimings {
        connect_retries: 40,
        connect_retry_delay: Duration::from_millis(50),
        authenticate: Duration::from_secs(2),
        idle_wait: Duration::from_secs(10),
        exit_pause: Duration::from_millis(10),
    }
}

/// Holds worker sessions back until opened. Waits give up after ten
/// seconds so a failing test cannot hang its host threads.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub(crate) fn open(&self) {
        *self.open.lock().expect("gate mutex") = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let guard = self.open.lock().expect("gate mutex");
        drop(
            self.opened
                .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
                .expect("gate mutex"),
        );
    }
}

pub(crate) struct Cluster {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) reporter: Arc<RecordingHealthReporter>,
    supervisor: Option<Arc<ThreadSupervisor>>,
    listener: Option<ListenerHandle>,
    addr: SocketAddr,
}

impl Cluster {
    /// Starts the dispatcher and its listener. No workers run until
    /// [`Self::supervise`] is called.
    pub(crate) fn new(policy: Policy) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(policy));
        let reporter = Arc::new(RecordingHealthReporter::default());
        let handler = Arc::new(DispatchConnectionHandler::new(
            Arc::clone(&dispatcher),
            TOKEN,
            protocol_timings(),
            Arc::clone(&reporter) as Arc<dyn HealthReporter>,
        ));
        let listener = SocketListener::bind("127.0.0.1", 0).expect("bind dispatch listener");
        let addr = listener.local_addr();
        let listener = listener.start(handler).expect("start dispatch listener");
        Self {
            dispatcher,
            reporter,
            supervisor: None,
            listener: Some(listener),
            addr,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Starts thread-hosted workers for every slot.
    pub(crate) fn supervise(&mut self, probes: ProbeFactory, growth_limit: Option<u32>) -> Arc<ThreadSupervisor> {
        self.supervise_after(probes, growth_limit, None)
    }

    /// As [`Self::supervise`], but every session waits for `gate` first.
    pub(crate) fn supervise_after(
        &mut self,
        probes: ProbeFactory,
        growth_limit: Option<u32>,
        gate: Option<Arc<Gate>>,
    ) -> Arc<ThreadSupervisor> {
        let addr = self.addr;
        let registry = Arc::new(OperationRegistry::with_builtins());
        let factory: WorkerFactory = Arc::new(move |number| {
            if let Some(gate) = &gate {
                gate.wait();
            }
            WorkerProcess::new(number, addr, TOKEN, Arc::clone(&registry))
                .with_probe(probes(number))
                .with_memory_growth_limit(growth_limit)
                .with_timings(worker_timings())
        });
        let supervisor = Arc::new(ThreadSupervisor::with_factory(
            factory,
            Arc::clone(&self.reporter) as Arc<dyn HealthReporter>,
        ));
        self.dispatcher
            .use_supervisor(Arc::clone(&supervisor) as Arc<dyn WorkerSupervisor>)
            .expect("install supervisor");
        self.supervisor = Some(Arc::clone(&supervisor));
        supervisor
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown();
        }
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
            drop(listener.join());
        }
    }
}

/// A hand-driven worker connection for protocol-level scenarios.
pub(crate) struct RawWorker {
    pub(crate) pipe: FramePipe,
}

impl RawWorker {
    pub(crate) fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to dispatch server");
        Self {
            pipe: FramePipe::new(stream).expect("worker pipe"),
        }
    }

    /// Sends `authenticate` and returns whether the server accepted it.
    pub(crate) fn authenticate(&mut self, protocol_version: u32, worker_number: usize, token: &str) -> bool {
        self.pipe
            .send(&WireMessage::Authenticate {
                protocol_version,
                worker_number,
                token: token.to_owned(),
            })
            .expect("send authenticate");
        match self.receive(Duration::from_secs(5)) {
            Some(WireMessage::AuthenticateAccepted { accepted }) => accepted,
            other => panic!("expected authenticate_accepted, got {other:?}"),
        }
    }

    pub(crate) fn join(addr: SocketAddr, worker_number: usize) -> Self {
        let mut worker = Self::connect(addr);
        assert!(
            worker.authenticate(PROTOCOL_VERSION, worker_number, TOKEN),
            "raw worker {worker_number} was refused"
        );
        worker
    }

    pub(crate) fn receive(&mut self, timeout: Duration) -> Option<WireMessage> {
        self.try_receive(timeout).expect("receive from dispatch server")
    }

    pub(crate) fn try_receive(&mut self, timeout: Duration) -> Result<Option<WireMessage>, PipeError> {
        self.pipe.receive::<WireMessage>(timeout)
    }
}

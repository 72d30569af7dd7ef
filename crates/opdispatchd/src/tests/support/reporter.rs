//! Test double for [`HealthReporter`] that records lifecycle events.

use std::net::SocketAddr;
use std::sync::Mutex;

use opdispatch_config::Config;

use crate::health::HealthReporter;
use crate::server::ConnectionError;
use crate::service::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HealthEvent {
    ServiceStarting,
    ServiceReady,
    ServiceFailed(String),
    WorkerConnected { worker: usize, generation: u64 },
    WorkerDisconnected { worker: Option<usize>, error: Option<String> },
    WorkerRestartRequested(usize),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    pub(crate) fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Generations of every accepted connection for `worker`, in order.
    pub(crate) fn connections_of(&self, worker: usize) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HealthEvent::WorkerConnected {
                    worker: number,
                    generation,
                } if number == worker => Some(generation),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn service_starting(&self) {
        self.record(HealthEvent::ServiceStarting);
    }

    fn service_ready(&self, _config: &Config, _addr: SocketAddr) {
        self.record(HealthEvent::ServiceReady);
    }

    fn service_failed(&self, error: &ServiceError) {
        self.record(HealthEvent::ServiceFailed(error.to_string()));
    }

    fn worker_connected(&self, worker: usize, generation: u64) {
        self.record(HealthEvent::WorkerConnected { worker, generation });
    }

    fn worker_disconnected(&self, worker: Option<usize>, error: Option<&ConnectionError>) {
        self.record(HealthEvent::WorkerDisconnected {
            worker,
            error: error.map(ToString::to_string),
        });
    }

    fn worker_restart_requested(&self, worker: usize) {
        self.record(HealthEvent::WorkerRestartRequested(worker));
    }
}

//! Structured health reporting for dispatcher lifecycle events.

use std::net::SocketAddr;
use std::sync::Arc;

use opdispatch_config::Config;

use crate::server::ConnectionError;
use crate::service::ServiceError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before the dispatch service starts.
    fn service_starting(&self);

    /// Invoked once the listener is accepting worker connections.
    fn service_ready(&self, config: &Config, addr: SocketAddr);

    /// Invoked when the service fails to start.
    fn service_failed(&self, error: &ServiceError);

    /// Invoked after a worker authenticates and takes its slot.
    fn worker_connected(&self, worker: usize, generation: u64);

    /// Invoked when a worker connection ends, with the error that ended it.
    fn worker_disconnected(&self, worker: Option<usize>, error: Option<&ConnectionError>);

    /// Invoked when a supervisor (re)starts the worker for a slot.
    fn worker_restart_requested(&self, worker: usize);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn service_starting(&self) {
        (**self).service_starting();
    }

    fn service_ready(&self, config: &Config, addr: SocketAddr) {
        (**self).service_ready(config, addr);
    }

    fn service_failed(&self, error: &ServiceError) {
        (**self).service_failed(error);
    }

    fn worker_connected(&self, worker: usize, generation: u64) {
        (**self).worker_connected(worker, generation);
    }

    fn worker_disconnected(&self, worker: Option<usize>, error: Option<&ConnectionError>) {
        (**self).worker_disconnected(worker, error);
    }

    fn worker_restart_requested(&self, worker: usize) {
        (**self).worker_restart_requested(worker);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn service_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "service_starting",
            "starting dispatch service"
        );
    }

    fn service_ready(&self, config: &Config, addr: SocketAddr) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "service_ready",
            addr = %addr,
            workers = config.workers,
            max_ops_per_application = config.max_ops_per_application,
            max_queue_length = config.max_queue_length,
            log_format = %config.log_format(),
            "dispatch service ready"
        );
    }

    fn service_failed(&self, error: &ServiceError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "service_failed",
            error = %error,
            "dispatch service failed to start"
        );
    }

    fn worker_connected(&self, worker: usize, generation: u64) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "worker_connected",
            worker,
            generation,
            "worker connected"
        );
    }

    fn worker_disconnected(&self, worker: Option<usize>, error: Option<&ConnectionError>) {
        match error {
            None => tracing::info!(
                target: HEALTH_TARGET,
                event = "worker_disconnected",
                worker = ?worker,
                "worker disconnected"
            ),
            Some(error) => tracing::warn!(
                target: HEALTH_TARGET,
                event = "worker_disconnected",
                worker = ?worker,
                error = %error,
                "worker connection ended with an error"
            ),
        }
    }

    fn worker_restart_requested(&self, worker: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "worker_restart_requested",
            worker,
            "starting worker"
        );
    }
}

//! Dispatch service bootstrap.
//!
//! [`DispatchService::start`] validates the configuration, installs
//! telemetry, binds the dispatch listener, creates the [`Dispatcher`] and
//! hands it a supervisor. Health events are reported at each stage so a
//! failed start can be diagnosed from the logs alone.

use std::net::SocketAddr;
use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use opdispatch_config::{Config, ConfigError};

use crate::dispatcher::{
    ApplicationId, ApplicationQueuer, DispatchError, Dispatcher, Policy, PolicyError,
};
use crate::health::HealthReporter;
use crate::operation::OperationRegistry;
use crate::server::{DispatchConnectionHandler, ProtocolTimings, SERVER_TARGET};
use crate::supervisor::{
    ProcessSupervisor, ProcessSupervisorError, ThreadSupervisor, WorkerSupervisor,
};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};
use crate::transport::{ListenerError, ListenerHandle, SocketListener};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the dispatcher configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader that returns a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Builds a supervisor for workers that reach the server at the given
/// address with the given token.
pub type SupervisorFactory =
    Box<dyn FnOnce(SocketAddr, &str) -> Arc<dyn WorkerSupervisor> + Send>;

/// How the service keeps its workers running.
pub enum SupervisorKind {
    /// `opworker` child processes.
    Process,
    /// Worker sessions on threads inside this process.
    InProcess(Arc<OperationRegistry>),
    /// A caller-provided supervisor.
    Custom(SupervisorFactory),
}

impl std::fmt::Debug for SupervisorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("Process"),
            Self::InProcess(registry) => f.debug_tuple("InProcess").field(registry).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Errors surfaced while starting the dispatch service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration values were rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// The dispatch policy could not be built.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {0}")]
    Telemetry(#[from] TelemetryError),
    /// The dispatch listener could not be bound or started.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// The process supervisor could not be prepared.
    #[error(transparent)]
    Supervisor(#[from] ProcessSupervisorError),
    /// The dispatcher refused the supervisor.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A running dispatcher with its listener and supervised workers.
pub struct DispatchService {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<dyn WorkerSupervisor>,
    listener: Option<ListenerHandle>,
    addr: SocketAddr,
    token: String,
    telemetry: TelemetryHandle,
}

impl DispatchService {
    /// Loads configuration through `loader` and starts the service.
    pub fn bootstrap_with(
        loader: &dyn ConfigLoader,
        kind: SupervisorKind,
        reporter: Arc<dyn HealthReporter>,
    ) -> Result<Self, ServiceError> {
        reporter.service_starting();
        let config = match loader.load() {
            Ok(config) => config,
            Err(source) => {
                let error = ServiceError::Configuration { source };
                reporter.service_failed(&error);
                return Err(error);
            }
        };
        Self::launch(config, kind, ProtocolTimings::default(), reporter)
    }

    /// Starts the service with default protocol timings.
    pub fn start(
        config: Config,
        kind: SupervisorKind,
        reporter: Arc<dyn HealthReporter>,
    ) -> Result<Self, ServiceError> {
        Self::start_with_timings(config, kind, ProtocolTimings::default(), reporter)
    }

    /// Starts the service with explicit protocol timings.
    pub fn start_with_timings(
        config: Config,
        kind: SupervisorKind,
        timings: ProtocolTimings,
        reporter: Arc<dyn HealthReporter>,
    ) -> Result<Self, ServiceError> {
        reporter.service_starting();
        Self::launch(config, kind, timings, reporter)
    }

    fn launch(
        config: Config,
        kind: SupervisorKind,
        timings: ProtocolTimings,
        reporter: Arc<dyn HealthReporter>,
    ) -> Result<Self, ServiceError> {
        match Self::assemble(config, kind, timings, &reporter) {
            Ok(service) => {
                reporter.service_ready(&service.config, service.addr);
                Ok(service)
            }
            Err(error) => {
                reporter.service_failed(&error);
                Err(error)
            }
        }
    }

    fn assemble(
        config: Config,
        kind: SupervisorKind,
        timings: ProtocolTimings,
        reporter: &Arc<dyn HealthReporter>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let telemetry = telemetry::initialise(&config)?;
        let policy = Policy::from_config(&config)?;
        let token = config
            .auth_token
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let (host, port) = config.dispatch_address();
        let listener = SocketListener::bind(host, port)?;
        let addr = listener.local_addr();

        let dispatcher = Arc::new(Dispatcher::new(policy));
        let handler = Arc::new(DispatchConnectionHandler::new(
            Arc::clone(&dispatcher),
            token.clone(),
            timings,
            Arc::clone(reporter),
        ));
        let listener = listener.start(handler)?;

        let supervisor: Arc<dyn WorkerSupervisor> = match kind {
            SupervisorKind::Process => Arc::new(ProcessSupervisor::from_config(
                &config,
                addr,
                &token,
                Arc::clone(reporter),
            )?),
            SupervisorKind::InProcess(registry) => Arc::new(ThreadSupervisor::new(
                addr,
                token.clone(),
                registry,
                config.memory_growth_threshold(),
                Arc::clone(reporter),
            )),
            SupervisorKind::Custom(factory) => factory(addr, &token),
        };
        dispatcher.use_supervisor(Arc::clone(&supervisor))?;
        info!(
            target: SERVER_TARGET,
            addr = %addr,
            workers = dispatcher.policy().workers(),
            "dispatch service started"
        );

        Ok(Self {
            config,
            dispatcher,
            supervisor,
            listener: Some(listener),
            addr,
            token,
            telemetry,
        })
    }

    /// Queuer that submits on behalf of `application`.
    #[must_use]
    pub fn queuer(&self, application: impl Into<ApplicationId>) -> ApplicationQueuer {
        self.dispatcher.queuer(application)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address workers connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Token workers must present.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Stops the workers and the listener.
    ///
    /// Connections that are already open end when their workers go away.
    pub fn shutdown(mut self) -> Result<(), ServiceError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        let Some(listener) = self.listener.take() else {
            return Ok(());
        };
        self.supervisor.shutdown();
        listener.shutdown();
        listener.join()?;
        info!(target: SERVER_TARGET, "dispatch service stopped");
        Ok(())
    }
}

impl Drop for DispatchService {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            tracing::warn!(
                target: SERVER_TARGET,
                error = %error,
                "dispatch service did not stop cleanly"
            );
        }
    }
}

impl std::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("addr", &self.addr)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

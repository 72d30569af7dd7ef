//! Errors surfaced while launching an `opworker` process.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;

use opdispatch_config::{ConfigError, RuntimePathsError};

use crate::telemetry::TelemetryError;
use crate::worker::WorkerError;

/// Errors surfaced while launching or running a worker process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The worker number argument was missing.
    #[error("usage: opworker <worker-number> [options]")]
    MissingWorkerNumber,
    /// The worker number argument was not a number.
    #[error("invalid worker number '{value}'")]
    InvalidWorkerNumber {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration values were rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// No token was handed to the worker.
    #[error("no authentication token configured; set OPDISPATCH_AUTH_TOKEN")]
    MissingToken,
    /// The dispatch address could not be resolved.
    #[error("failed to resolve dispatch address {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// Resolution produced no addresses.
    #[error("no addresses resolved for dispatch address {host}:{port}")]
    ResolveEmpty { host: String, port: u16 },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {0}")]
    Telemetry(#[from] TelemetryError),
    /// The runtime directory could not be prepared.
    #[error(transparent)]
    Runtime(#[from] RuntimePathsError),
    /// Writing the readiness marker failed.
    #[error("failed to write readiness marker '{path}': {source}")]
    MarkerWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The system clock is before the Unix epoch.
    #[error("system clock is before the Unix epoch: {source}")]
    Clock {
        #[source]
        source: std::time::SystemTimeError,
    },
    /// Serialising the readiness marker failed.
    #[error("failed to serialise readiness marker: {0}")]
    MarkerEncode(#[from] serde_json::Error),
    /// The worker session failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl From<Arc<OrthoError>> for LaunchError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Config { source }
    }
}

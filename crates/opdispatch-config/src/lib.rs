//! Shared configuration for the operation dispatcher and its workers.
//!
//! Values are layered by [`ortho_config`]: built-in defaults, configuration
//! files, `OPDISPATCH_*` environment variables and finally command-line
//! flags. The dispatcher hands the resolved values to the worker processes it
//! supervises through the environment, so both sides agree on the dispatch
//! address, the authentication token and the health policy.

mod defaults;
mod logging;
mod runtime;

use std::net::IpAddr;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_DISPATCH_HOST, DEFAULT_DISPATCH_PORT, DEFAULT_LOG_FILTER,
    DEFAULT_MAX_OPS_PER_APPLICATION, DEFAULT_MAX_QUEUE_LENGTH, DEFAULT_MEMORY_GROWTH_PERCENT,
    DEFAULT_WORKERS, default_dispatch_host, default_log_filter, default_log_filter_string,
    default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{RuntimePaths, RuntimePathsError};

/// Prefix applied to environment variables read by [`Config`].
pub const ENV_PREFIX: &str = "OPDISPATCH";

/// Resolved dispatcher and worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "OPDISPATCH")]
pub struct Config {
    /// Loopback host the dispatch server binds and workers connect to.
    #[ortho_config(default = default_dispatch_host())]
    pub dispatch_host: String,
    /// TCP port of the dispatch server.
    #[ortho_config(default = DEFAULT_DISPATCH_PORT)]
    pub dispatch_port: u16,
    /// Number of worker slots and supervised worker processes.
    #[ortho_config(default = DEFAULT_WORKERS)]
    pub workers: usize,
    /// Ceiling on concurrently running operations per application.
    #[ortho_config(default = DEFAULT_MAX_OPS_PER_APPLICATION)]
    pub max_ops_per_application: usize,
    /// Maximum number of queued operations.
    #[ortho_config(default = DEFAULT_MAX_QUEUE_LENGTH)]
    pub max_queue_length: usize,
    /// Memory growth in percent that makes a worker exit for a fresh restart.
    /// Zero disables memory-triggered restarts.
    #[ortho_config(default = DEFAULT_MEMORY_GROWTH_PERCENT)]
    pub memory_growth_percent: u32,
    /// Shared secret workers present when authenticating.
    pub auth_token: Option<String>,
    /// Path to the worker executable launched by the process supervisor.
    pub worker_program: Option<String>,
    /// Directory for runtime artefacts such as worker readiness markers.
    pub runtime_dir: Option<String>,
    /// Tracing filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch_host: default_dispatch_host(),
            dispatch_port: DEFAULT_DISPATCH_PORT,
            workers: DEFAULT_WORKERS,
            max_ops_per_application: DEFAULT_MAX_OPS_PER_APPLICATION,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            memory_growth_percent: DEFAULT_MEMORY_GROWTH_PERCENT,
            auth_token: None,
            worker_program: None,
            runtime_dir: None,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Host and port the dispatch server listens on.
    #[must_use]
    pub fn dispatch_address(&self) -> (&str, u16) {
        (self.dispatch_host.as_str(), self.dispatch_port)
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Memory growth threshold, or `None` when restarts are disabled.
    #[must_use]
    pub fn memory_growth_threshold(&self) -> Option<u32> {
        (self.memory_growth_percent > 0).then_some(self.memory_growth_percent)
    }

    /// Checks the values that cannot be expressed through types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroValue { field: "workers" });
        }
        if self.max_ops_per_application == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_ops_per_application",
            });
        }
        if self.max_queue_length == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_queue_length",
            });
        }
        if !is_loopback_host(&self.dispatch_host) {
            return Err(ConfigError::NonLoopbackHost {
                host: self.dispatch_host.clone(),
            });
        }
        if self
            .auth_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(ConfigError::EmptyToken);
        }
        Ok(())
    }
}

/// Returns true when the host names the local machine only.
#[must_use]
pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

/// Configuration values rejected by [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A policy value that must be positive was zero.
    #[error("configuration value '{field}' must be greater than zero")]
    ZeroValue { field: &'static str },
    /// The dispatch host is reachable from other machines.
    #[error("dispatch host '{host}' is not a loopback address")]
    NonLoopbackHost { host: String },
    /// An authentication token was configured but is blank.
    #[error("authentication token must not be blank")]
    EmptyToken,
}

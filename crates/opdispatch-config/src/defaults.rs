//! Built-in defaults shared by the dispatcher and the worker binary.

use crate::logging::LogFormat;

/// Loopback host the dispatch server listens on.
pub const DEFAULT_DISPATCH_HOST: &str = "127.0.0.1";

/// TCP port the dispatch server listens on and workers connect to.
pub const DEFAULT_DISPATCH_PORT: u16 = 1888;

/// Number of worker slots.
pub const DEFAULT_WORKERS: usize = 4;

/// Maximum number of operations one application may have in flight.
pub const DEFAULT_MAX_OPS_PER_APPLICATION: usize = 2;

/// Maximum number of queued operations across all applications.
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 512;

/// Memory growth, in percent of the startup level, that makes a worker restart.
pub const DEFAULT_MEMORY_GROWTH_PERCENT: u32 = 32;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Owned dispatch host used where allocation is required.
pub fn default_dispatch_host() -> String {
    DEFAULT_DISPATCH_HOST.to_string()
}

/// Default log filter expression used by the binaries.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

/// Default logging format for the binaries.
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

//! Derives runtime artefact paths shared by the dispatcher and its workers.
//!
//! The runtime directory houses the readiness markers written by worker
//! processes. The supervisor and external process managers need to agree on
//! the directory layout so they can poll the markers for health.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

const RUNTIME_NAMESPACE: &str = "opdispatch";

/// Canonical paths for runtime artefacts written by worker processes.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from the shared configuration, creating the
    /// directory when it does not exist yet.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let runtime_dir = match config.runtime_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_runtime_directory(),
        };
        fs::create_dir_all(&runtime_dir).map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: runtime_dir.clone(),
            source,
        })?;
        Ok(Self { runtime_dir })
    }

    /// Directory holding runtime artefacts.
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.as_path()
    }

    /// Path of the readiness marker written by the given worker.
    pub fn worker_health_path(&self, worker_number: usize) -> PathBuf {
        self.runtime_dir
            .join(format!("opworker-{worker_number}.health"))
    }
}

fn default_runtime_directory() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push(RUNTIME_NAMESPACE);
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push(RUNTIME_NAMESPACE);
        dir.push(format!("uid-{}", unsafe { geteuid() }));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push(RUNTIME_NAMESPACE);
        dir
    }
}

/// Errors raised while deriving runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

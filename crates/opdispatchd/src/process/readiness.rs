//! Readiness marker written by each `opworker` process.
//!
//! The marker is a one-line JSON snapshot at
//! `<runtime_dir>/opworker-<n>.health`. It reads `starting` while the worker
//! connects, `ready` once the worker has authenticated and `stopping` on the
//! way out; the file is removed when the marker is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::files::atomic_write;

/// Lifecycle stage recorded in the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Starting,
    Ready,
    Stopping,
}

/// Contents of a readiness marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSnapshot {
    pub status: MarkerStatus,
    pub pid: u32,
    pub worker: usize,
    /// Seconds since the Unix epoch when the snapshot was written.
    pub timestamp: u64,
}

/// Owns the marker file for one worker process.
#[derive(Debug)]
pub struct ReadinessMarker {
    path: PathBuf,
    worker: usize,
    pid: u32,
}

impl ReadinessMarker {
    #[must_use]
    pub fn new(path: PathBuf, worker: usize) -> Self {
        Self {
            path,
            worker,
            pid: std::process::id(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the marker with a snapshot in `status`.
    pub fn write(&self, status: MarkerStatus) -> Result<(), LaunchError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|source| LaunchError::Clock { source })?
            .as_secs();
        let snapshot = ReadinessSnapshot {
            status,
            pid: self.pid,
            worker: self.worker,
            timestamp,
        };
        let payload = serde_json::to_vec(&snapshot)?;
        atomic_write(&self.path, &payload).map_err(|source| LaunchError::MarkerWrite {
            path: self.path.clone(),
            source,
        })?;
        info!(
            target: PROCESS_TARGET,
            worker = self.worker,
            status = ?status,
            file = %self.path.display(),
            "readiness marker updated"
        );
        Ok(())
    }

    /// Reads the snapshot stored at `path`, if any.
    pub fn read(path: &Path) -> io::Result<Option<ReadinessSnapshot>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl Drop for ReadinessMarker {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(
                    target: PROCESS_TARGET,
                    file = %self.path.display(),
                    error = %error,
                    "failed to remove readiness marker"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn runtime_dir() -> TempDir {
        TempDir::new().expect("temp dir")
    }

    #[rstest]
    fn marker_tracks_status_and_is_removed_on_drop(runtime_dir: TempDir) {
        let path = runtime_dir.path().join("opworker-3.health");
        let marker = ReadinessMarker::new(path.clone(), 3);

        marker.write(MarkerStatus::Starting).expect("write starting");
        let starting = ReadinessMarker::read(&path)
            .expect("read marker")
            .expect("marker present");
        assert_eq!(starting.status, MarkerStatus::Starting);
        assert_eq!(starting.worker, 3);
        assert_eq!(starting.pid, std::process::id());

        marker.write(MarkerStatus::Ready).expect("write ready");
        let ready = ReadinessMarker::read(&path)
            .expect("read marker")
            .expect("marker present");
        assert_eq!(ready.status, MarkerStatus::Ready);

        drop(marker);
        assert!(!path.exists());
        assert_eq!(ReadinessMarker::read(&path).expect("read missing"), None);
    }

    #[rstest]
    fn snapshot_uses_lowercase_status(runtime_dir: TempDir) {
        let path = runtime_dir.path().join("opworker-0.health");
        let marker = ReadinessMarker::new(path.clone(), 0);
        marker.write(MarkerStatus::Stopping).expect("write stopping");

        let raw = fs::read_to_string(&path).expect("read raw marker");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("marker is json");
        assert_eq!(value["status"], "stopping");
        assert_eq!(value["worker"], 0);
        assert!(value["timestamp"].as_u64().is_some());
    }

    #[rstest]
    fn missing_parent_reports_the_path(runtime_dir: TempDir) {
        let path = runtime_dir.path().join("absent").join("opworker-1.health");
        let marker = ReadinessMarker::new(path.clone(), 1);

        let error = marker
            .write(MarkerStatus::Starting)
            .expect_err("write should fail without a directory");
        assert!(matches!(error, LaunchError::MarkerWrite { path: failed, .. } if failed == path));
    }
}

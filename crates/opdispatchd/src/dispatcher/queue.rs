//! Queue entries and the assignments handed to connection threads.

use std::fmt;
use std::time::{Duration, Instant};

use crate::operation::{OperationEnvelope, OperationError, OperationId, QueuedOperation};

/// Tenant identifier used for the per-application concurrency ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApplicationId(String);

impl ApplicationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApplicationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ApplicationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub(crate) struct QueueEntry {
    pub(crate) operation: Box<dyn QueuedOperation>,
    pub(crate) application: ApplicationId,
    pub(crate) enqueued_at: Instant,
}

impl QueueEntry {
    pub(crate) fn new(operation: Box<dyn QueuedOperation>, application: ApplicationId) -> Self {
        Self {
            operation,
            application,
            enqueued_at: Instant::now(),
        }
    }

    /// Runs the pre-dispatch hook and encodes the operation.
    pub(crate) fn prepare(&mut self) -> Result<OperationEnvelope, OperationError> {
        self.operation.before_remote_execution()?;
        self.operation.envelope()
    }
}

/// An operation taken from the queue for one worker.
///
/// Owned by the connection thread while the operation is in flight and
/// handed back through `return_work` or `finished_work`.
pub struct Assignment {
    pub(crate) entry: QueueEntry,
    envelope: OperationEnvelope,
    started_at: Instant,
}

impl Assignment {
    pub(crate) fn new(entry: QueueEntry, envelope: OperationEnvelope, started_at: Instant) -> Self {
        Self {
            entry,
            envelope,
            started_at,
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &OperationEnvelope {
        &self.envelope
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.entry.operation.id()
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.entry.operation.kind()
    }

    #[must_use]
    pub fn application(&self) -> &ApplicationId {
        &self.entry.application
    }

    /// Time spent queued before this assignment.
    #[must_use]
    pub fn queued_for(&self) -> Duration {
        self.started_at.saturating_duration_since(self.entry.enqueued_at)
    }

    #[must_use]
    pub fn running_for(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assignment")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("application", &self.entry.application)
            .finish_non_exhaustive()
    }
}

//! Per-worker slot state.

use std::sync::Arc;
use std::time::Instant;

use super::ApplicationId;
use crate::operation::OperationId;
use crate::transport::WorkerWaker;

/// Identifies one connection of a worker slot.
///
/// The generation changes on every disconnect, so a handle kept by a
/// connection that has since gone away is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    number: usize,
    generation: u64,
}

impl WorkerHandle {
    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// How a worker's connection should continue after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Healthy; the slot goes back to idle.
    Ok,
    /// Unresponsive or broken; the slot is disconnected and the supervisor
    /// is asked to replace the worker.
    Failed,
    /// Leaving voluntarily; the slot is disconnected without a failure report.
    Disconnecting,
}

/// Snapshot of a slot for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub connected: bool,
    pub failed: bool,
    pub generation: u64,
    pub current: Option<OperationId>,
}

pub(crate) struct InFlight {
    pub(crate) id: OperationId,
    pub(crate) application: ApplicationId,
    pub(crate) started_at: Instant,
}

#[derive(Default)]
pub(crate) struct WorkerSlot {
    generation: u64,
    connected: bool,
    failed: bool,
    pub(crate) current: Option<InFlight>,
    waker: Option<Arc<dyn WorkerWaker>>,
}

impl WorkerSlot {
    pub(crate) fn matches(&self, handle: WorkerHandle) -> bool {
        self.connected && self.generation == handle.generation
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.connected && self.current.is_none()
    }

    pub(crate) fn connect(&mut self, number: usize, waker: Arc<dyn WorkerWaker>) -> WorkerHandle {
        self.connected = true;
        self.failed = false;
        self.current = None;
        self.waker = Some(waker);
        WorkerHandle {
            number,
            generation: self.generation,
        }
    }

    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
        self.current = None;
        self.waker = None;
        self.generation += 1;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub(crate) fn waker(&self) -> Option<&Arc<dyn WorkerWaker>> {
        self.waker.as_ref()
    }

    pub(crate) fn set_waker(&mut self, waker: Arc<dyn WorkerWaker>) {
        self.waker = Some(waker);
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        WorkerStatus {
            connected: self.connected,
            failed: self.failed,
            generation: self.generation,
            current: self.current.as_ref().map(|in_flight| in_flight.id),
        }
    }
}

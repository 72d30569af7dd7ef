//! Central scheduler owning the operation queue and the worker slot table.
//!
//! Every change to the queue or to a slot happens under one mutex. The lock
//! is never held across I/O: pre-dispatch hooks, outcome notifications,
//! wake-ups and supervisor calls all run after it is released.
//!
//! Assignment is first fit. `next_work` takes the earliest queued entry
//! whose application is below the per-application ceiling, so one busy
//! tenant cannot starve the others while each tenant stays FIFO.

mod errors;
mod policy;
mod queue;
mod queuer;
mod slot;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

pub use self::errors::DispatchError;
pub use self::policy::{Policy, PolicyError};
pub use self::queue::{ApplicationId, Assignment};
pub use self::queuer::ApplicationQueuer;
pub use self::slot::{WorkerHandle, WorkerState, WorkerStatus};
use self::queue::QueueEntry;
use self::slot::{InFlight, WorkerSlot};
use crate::operation::{OperationError, QueuedOperation, ResultRecord, duration_millis};
use crate::supervisor::WorkerSupervisor;
use crate::transport::WorkerWaker;

pub(crate) const DISPATCHER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatcher");

/// Queue, worker table and policy for one dispatch run.
pub struct Dispatcher {
    policy: Policy,
    state: Mutex<DispatchState>,
    supervisor: OnceCell<Arc<dyn WorkerSupervisor>>,
}

struct DispatchState {
    queue: VecDeque<QueueEntry>,
    slots: Vec<WorkerSlot>,
}

impl DispatchState {
    fn slot(&self, number: usize) -> Result<&WorkerSlot, DispatchError> {
        let workers = self.slots.len();
        self.slots
            .get(number)
            .ok_or(DispatchError::WorkerOutOfRange { number, workers })
    }

    fn slot_mut(&mut self, number: usize) -> Result<&mut WorkerSlot, DispatchError> {
        let workers = self.slots.len();
        self.slots
            .get_mut(number)
            .ok_or(DispatchError::WorkerOutOfRange { number, workers })
    }

    fn connected_slot(&mut self, handle: WorkerHandle) -> Result<&mut WorkerSlot, DispatchError> {
        let slot = self.slot_mut(handle.number())?;
        if !slot.matches(handle) {
            return Err(DispatchError::StaleWorker {
                number: handle.number(),
                generation: handle.generation(),
            });
        }
        Ok(slot)
    }

    fn in_flight_counts(&self) -> HashMap<&ApplicationId, usize> {
        let mut counts = HashMap::new();
        for in_flight in self.slots.iter().filter_map(|slot| slot.current.as_ref()) {
            *counts.entry(&in_flight.application).or_insert(0) += 1;
        }
        counts
    }

    /// Index of the first entry whose application is below the ceiling.
    fn first_admissible(&self, ceiling: usize) -> Option<usize> {
        let counts = self.in_flight_counts();
        self.queue.iter().position(|entry| {
            counts.get(&entry.application).copied().unwrap_or(0) < ceiling
        })
    }

    /// Waker of the lowest-numbered connected idle worker, if work is queued.
    fn idle_waker(&self) -> Option<Arc<dyn WorkerWaker>> {
        if self.queue.is_empty() {
            return None;
        }
        self.slots
            .iter()
            .find(|slot| slot.is_idle())
            .and_then(WorkerSlot::waker)
            .cloned()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        let slots = (0..policy.workers()).map(|_| WorkerSlot::default()).collect();
        Self {
            policy,
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                slots,
            }),
            supervisor: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, DispatchState>, DispatchError> {
        self.state.lock().map_err(|_| DispatchError::Poisoned)
    }

    /// Attaches the supervisor and asks it to start the worker pool.
    pub fn use_supervisor(&self, supervisor: Arc<dyn WorkerSupervisor>) -> Result<(), DispatchError> {
        self.supervisor
            .set(Arc::clone(&supervisor))
            .map_err(|_| DispatchError::SupervisorAlreadySet)?;
        supervisor.start_supervision(&self.policy);
        Ok(())
    }

    /// Queuer that submits on behalf of `application`.
    #[must_use]
    pub fn queuer(self: &Arc<Self>, application: impl Into<ApplicationId>) -> ApplicationQueuer {
        ApplicationQueuer::new(Arc::clone(self), application.into())
    }

    /// Appends an operation to the queue and wakes an idle worker.
    ///
    /// On rejection the operation is discarded without notification and the
    /// error goes back to the submitter.
    pub fn queue_operation(
        &self,
        operation: Box<dyn QueuedOperation>,
        application: ApplicationId,
    ) -> Result<(), DispatchError> {
        let waker = {
            let mut state = match self.lock() {
                Ok(state) => state,
                Err(error) => {
                    operation.discard();
                    return Err(error);
                }
            };
            let limit = self.policy.max_queue_length();
            if state.queue.len() >= limit {
                warn!(
                    target: DISPATCHER_TARGET,
                    application = %application,
                    kind = operation.kind(),
                    limit,
                    "operation rejected, queue full"
                );
                operation.discard();
                return Err(DispatchError::QueueFull { limit });
            }
            debug!(
                target: DISPATCHER_TARGET,
                operation = %operation.id(),
                kind = operation.kind(),
                application = %application,
                queued = state.queue.len() + 1,
                "operation queued"
            );
            state.queue.push_back(QueueEntry::new(operation, application));
            state.idle_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Registers a newly authenticated worker connection.
    pub fn worker_connected(
        &self,
        number: usize,
        waker: Arc<dyn WorkerWaker>,
    ) -> Result<WorkerHandle, DispatchError> {
        let mut state = self.lock()?;
        let slot = state.slot_mut(number)?;
        if slot.is_connected() {
            return Err(DispatchError::AlreadyConnected { number });
        }
        let handle = slot.connect(number, waker);
        info!(
            target: DISPATCHER_TARGET,
            worker = number,
            generation = handle.generation(),
            "worker connected"
        );
        Ok(handle)
    }

    /// Replaces the waker used to interrupt the worker's idle wait.
    pub fn set_waker(
        &self,
        handle: WorkerHandle,
        waker: Arc<dyn WorkerWaker>,
    ) -> Result<(), DispatchError> {
        let mut state = self.lock()?;
        state.connected_slot(handle)?.set_waker(waker);
        Ok(())
    }

    /// Takes the next admissible operation for an idle worker.
    ///
    /// The pre-dispatch hook runs outside the lock; if it fails, that failure
    /// is the operation's outcome and the scan moves on to the next entry.
    pub fn next_work(&self, handle: WorkerHandle) -> Result<Option<Assignment>, DispatchError> {
        loop {
            let (mut entry, started_at) = {
                let mut state = self.lock()?;
                let ceiling = self.policy.max_ops_per_application();
                let slot = state.connected_slot(handle)?;
                if slot.current.is_some() {
                    return Err(DispatchError::AlreadyWorking {
                        number: handle.number(),
                    });
                }
                if let Some(waker) = slot.waker() {
                    waker.clear();
                }
                let Some(entry) = state
                    .first_admissible(ceiling)
                    .and_then(|index| state.queue.remove(index))
                else {
                    return Ok(None);
                };
                let started_at = Instant::now();
                state.connected_slot(handle)?.current = Some(InFlight {
                    id: entry.operation.id(),
                    application: entry.application.clone(),
                    started_at,
                });
                (entry, started_at)
            };

            match entry.prepare() {
                Ok(envelope) => {
                    let assignment = Assignment::new(entry, envelope, started_at);
                    debug!(
                        target: DISPATCHER_TARGET,
                        worker = handle.number(),
                        operation = %assignment.id(),
                        kind = assignment.kind(),
                        application = %assignment.application(),
                        queued_ms = duration_millis(assignment.queued_for()),
                        "operation assigned"
                    );
                    return Ok(Some(assignment));
                }
                Err(error) => {
                    debug!(
                        target: DISPATCHER_TARGET,
                        worker = handle.number(),
                        operation = %entry.operation.id(),
                        error = %error,
                        "operation refused before dispatch"
                    );
                    entry.operation.settle(Err(error));
                    let released = self.release(handle, WorkerState::Ok);
                    entry.operation.notify();
                    released?;
                }
            }
        }
    }

    /// Puts work the worker never acknowledged back at the head of the queue.
    ///
    /// The queue bound is not applied: returned work was already accepted, so
    /// a full queue may hold one extra entry per failed hand-off until it
    /// drains.
    pub fn return_work(
        &self,
        handle: WorkerHandle,
        assignment: Assignment,
        state: WorkerState,
    ) -> Result<(), DispatchError> {
        info!(
            target: DISPATCHER_TARGET,
            worker = handle.number(),
            operation = %assignment.id(),
            kind = assignment.kind(),
            "operation returned to the queue"
        );
        let (report, waker) = {
            let mut guard = self.lock()?;
            guard.queue.push_front(assignment.entry);
            let report = Self::apply_worker_state(&mut guard, handle, state);
            (report, guard.idle_waker())
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.report_failure(report);
        Ok(())
    }

    /// Records the outcome of an operation and notifies its submitter.
    pub fn finished_work(
        &self,
        handle: WorkerHandle,
        assignment: Assignment,
        outcome: Result<ResultRecord, OperationError>,
        state: WorkerState,
    ) -> Result<(), DispatchError> {
        debug!(
            target: DISPATCHER_TARGET,
            worker = handle.number(),
            operation = %assignment.id(),
            kind = assignment.kind(),
            succeeded = outcome.is_ok(),
            elapsed_ms = duration_millis(assignment.running_for()),
            "operation finished"
        );
        let mut entry = assignment.entry;
        entry.operation.settle(outcome);
        let applied = self.lock().map(|mut guard| {
            let report = Self::apply_worker_state(&mut guard, handle, state);
            (report, guard.idle_waker())
        });
        // The supervisor hears of a failed worker before the submitter wakes.
        if let Ok((report, _)) = &applied {
            self.report_failure(*report);
        }
        entry.operation.notify();
        let (_, waker) = applied?;
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Marks a slot disconnected after a clean shutdown of its connection.
    ///
    /// A worker with an operation in flight must hand it back first through
    /// `return_work` or `finished_work`.
    pub fn worker_disconnected(&self, handle: WorkerHandle) -> Result<(), DispatchError> {
        let mut state = self.lock()?;
        let slot = state.connected_slot(handle)?;
        if let Some(in_flight) = slot.current.as_ref() {
            warn!(
                target: DISPATCHER_TARGET,
                worker = handle.number(),
                operation = %in_flight.id,
                elapsed_ms = duration_millis(in_flight.started_at.elapsed()),
                "refusing to disconnect a worker with an operation in flight"
            );
            return Err(DispatchError::AlreadyWorking {
                number: handle.number(),
            });
        }
        slot.disconnect();
        info!(target: DISPATCHER_TARGET, worker = handle.number(), "worker disconnected");
        Ok(())
    }

    /// Final cleanup for a connection thread. Stale handles are ignored.
    pub fn cleanup_connection(&self, handle: WorkerHandle) {
        match self.worker_disconnected(handle) {
            Ok(()) | Err(DispatchError::StaleWorker { .. }) => {}
            Err(error) => warn!(
                target: DISPATCHER_TARGET,
                worker = handle.number(),
                error = %error,
                "connection cleanup failed"
            ),
        }
    }

    pub fn queue_len(&self) -> Result<usize, DispatchError> {
        Ok(self.lock()?.queue.len())
    }

    /// Number of operations of `application` currently assigned to workers.
    pub fn in_flight_for(&self, application: &ApplicationId) -> Result<usize, DispatchError> {
        let state = self.lock()?;
        Ok(state.in_flight_counts().get(application).copied().unwrap_or(0))
    }

    pub fn worker_status(&self, number: usize) -> Result<WorkerStatus, DispatchError> {
        Ok(self.lock()?.slot(number)?.status())
    }

    fn release(&self, handle: WorkerHandle, state: WorkerState) -> Result<(), DispatchError> {
        let report = {
            let mut guard = self.lock()?;
            Self::apply_worker_state(&mut guard, handle, state)
        };
        self.report_failure(report);
        Ok(())
    }

    /// Applies a worker state to its slot and returns the worker number to
    /// report to the supervisor, if any. Stale handles change nothing.
    fn apply_worker_state(
        state: &mut DispatchState,
        handle: WorkerHandle,
        worker_state: WorkerState,
    ) -> Option<usize> {
        let Ok(slot) = state.connected_slot(handle) else {
            return None;
        };
        slot.current = None;
        match worker_state {
            WorkerState::Ok => None,
            WorkerState::Failed => {
                slot.disconnect();
                slot.mark_failed();
                Some(handle.number())
            }
            WorkerState::Disconnecting => {
                slot.disconnect();
                None
            }
        }
    }

    fn report_failure(&self, worker: Option<usize>) {
        let Some(number) = worker else {
            return;
        };
        warn!(target: DISPATCHER_TARGET, worker = number, "worker failed");
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.worker_failed(number);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

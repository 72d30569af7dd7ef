//! Outcome delivery for submitted operations.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{
    OPERATION_TARGET, Operation, OperationEnvelope, OperationError, OperationId, QueuedOperation,
    ResultRecord,
};

/// Receives the outcome of an operation submitted in the background.
///
/// Exactly one of the two methods is called, once, and the operation is
/// handed back with it.
pub trait NotifyTarget<O: Operation>: Send {
    fn on_complete(self: Box<Self>, operation: O, output: O::Output);

    fn on_failure(self: Box<Self>, operation: O, error: OperationError);
}

/// Typed submission held by the dispatcher queue.
pub(crate) struct Submission<O: Operation> {
    id: OperationId,
    operation: Option<O>,
    outcome: Option<Result<O::Output, OperationError>>,
    target: Option<Box<dyn NotifyTarget<O>>>,
}

impl<O: Operation> Submission<O> {
    pub(crate) fn boxed(operation: O, target: Box<dyn NotifyTarget<O>>) -> Box<Self> {
        Box::new(Self {
            id: OperationId::new(),
            operation: Some(operation),
            outcome: None,
            target: Some(target),
        })
    }

    fn deliver(&mut self, outcome: Result<O::Output, OperationError>) {
        let (Some(operation), Some(target)) = (self.operation.take(), self.target.take()) else {
            return;
        };
        match outcome {
            Ok(output) => target.on_complete(operation, output),
            Err(error) => target.on_failure(operation, error),
        }
    }
}

impl<O: Operation> QueuedOperation for Submission<O> {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> &'static str {
        O::KIND
    }

    fn before_remote_execution(&mut self) -> Result<(), OperationError> {
        match self.operation.as_mut() {
            Some(operation) => operation.before_remote_execution(),
            None => Err(OperationError::Abandoned),
        }
    }

    fn envelope(&self) -> Result<OperationEnvelope, OperationError> {
        match self.operation.as_ref() {
            Some(operation) => OperationEnvelope::encode(self.id, operation),
            None => Err(OperationError::Abandoned),
        }
    }

    fn settle(&mut self, outcome: Result<ResultRecord, OperationError>) {
        self.outcome = Some(outcome.and_then(ResultRecord::decode::<O>));
    }

    fn notify(mut self: Box<Self>) {
        let outcome = self.outcome.take().unwrap_or(Err(OperationError::Abandoned));
        self.deliver(outcome);
    }

    fn discard(mut self: Box<Self>) {
        self.target = None;
    }
}

impl<O: Operation> Drop for Submission<O> {
    fn drop(&mut self) {
        if self.target.is_some() {
            debug!(
                target: OPERATION_TARGET,
                operation = %self.id,
                kind = O::KIND,
                "operation dropped without an outcome"
            );
            self.deliver(Err(OperationError::Abandoned));
        }
    }
}

/// Blocks a producer thread until its operation is settled.
pub(crate) struct Waiter<O: Operation> {
    slot: Mutex<Option<Result<O::Output, OperationError>>>,
    ready: Condvar,
}

impl<O: Operation> Waiter<O> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn target(self: &Arc<Self>) -> Box<dyn NotifyTarget<O>> {
        Box::new(WaitingTarget {
            waiter: Arc::clone(self),
        })
    }

    /// Waits for the outcome, indefinitely when `timeout` is `None`.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<O::Output, OperationError> {
        let started = Instant::now();
        let mut slot = self.slot.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = match timeout {
                None => self.ready.wait(slot).map_err(|_| poisoned())?,
                Some(limit) => {
                    let Some(remaining) = limit.checked_sub(started.elapsed()) else {
                        return Err(OperationError::WaitTimedOut {
                            waited_ms: duration_millis(limit),
                        });
                    };
                    self.ready
                        .wait_timeout(slot, remaining)
                        .map_err(|_| poisoned())?
                        .0
                }
            };
        }
    }

    fn complete(&self, outcome: Result<O::Output, OperationError>) {
        match self.slot.lock() {
            Ok(mut slot) => *slot = Some(outcome),
            Err(poisoned) => *poisoned.into_inner() = Some(outcome),
        }
        self.ready.notify_all();
    }
}

struct WaitingTarget<O: Operation> {
    waiter: Arc<Waiter<O>>,
}

impl<O: Operation> NotifyTarget<O> for WaitingTarget<O> {
    fn on_complete(self: Box<Self>, _operation: O, output: O::Output) {
        self.waiter.complete(Ok(output));
    }

    fn on_failure(self: Box<Self>, _operation: O, error: OperationError) {
        self.waiter.complete(Err(error));
    }
}

fn poisoned() -> OperationError {
    OperationError::dispatch("operation waiter lock poisoned")
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

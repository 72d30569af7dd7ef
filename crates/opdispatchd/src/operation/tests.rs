//! Behavioural tests for operation submission and notification.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::{fixture, rstest};
use serde::{Deserialize, Serialize};

use super::builtin::{Echo, Fail};
use super::{
    NotifyTarget, OpQueuer, Operation, OperationError, OperationRegistry, QueuedOperation,
    WorkerThreadGuard, is_worker_thread, set_default_queuer,
};

/// Executes submissions synchronously on the submitting thread.
struct InlineQueuer {
    registry: OperationRegistry,
}

impl OpQueuer for InlineQueuer {
    fn queue_operation(&self, mut operation: Box<dyn QueuedOperation>) -> Result<(), OperationError> {
        let outcome = operation
            .before_remote_execution()
            .and_then(|()| operation.envelope())
            .and_then(|envelope| self.registry.execute(&envelope));
        operation.settle(outcome);
        operation.notify();
        Ok(())
    }
}

/// Holds submissions without ever running them.
#[derive(Default)]
struct HoldingQueuer {
    held: Mutex<Vec<Box<dyn QueuedOperation>>>,
}

impl OpQueuer for HoldingQueuer {
    fn queue_operation(&self, operation: Box<dyn QueuedOperation>) -> Result<(), OperationError> {
        self.held.lock().expect("held lock").push(operation);
        Ok(())
    }
}

struct RejectingQueuer;

impl OpQueuer for RejectingQueuer {
    fn queue_operation(&self, operation: Box<dyn QueuedOperation>) -> Result<(), OperationError> {
        operation.discard();
        Err(OperationError::QueueFull { limit: 0 })
    }
}

type Delivered<O> = (O, Result<<O as Operation>::Output, OperationError>);

struct ChannelTarget<O: Operation> {
    sender: Sender<Delivered<O>>,
}

impl<O: Operation> NotifyTarget<O> for ChannelTarget<O> {
    fn on_complete(self: Box<Self>, operation: O, output: O::Output) {
        self.sender.send((operation, Ok(output))).expect("deliver completion");
    }

    fn on_failure(self: Box<Self>, operation: O, error: OperationError) {
        self.sender.send((operation, Err(error))).expect("deliver failure");
    }
}

fn channel_target<O: Operation>() -> (Box<dyn NotifyTarget<O>>, Receiver<Delivered<O>>) {
    let (sender, receiver) = mpsc::channel();
    (Box::new(ChannelTarget { sender }), receiver)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Guarded {
    allowed: bool,
}

impl Operation for Guarded {
    const KIND: &'static str = "test.guarded";
    type Output = bool;

    fn perform_operation(&mut self) -> Result<bool, OperationError> {
        Ok(true)
    }

    fn before_remote_execution(&mut self) -> Result<(), OperationError> {
        if self.allowed {
            Ok(())
        } else {
            Err(OperationError::failed("refused before dispatch"))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Nested {
    inner: Echo,
}

impl Operation for Nested {
    const KIND: &'static str = "test.nested";
    type Output = String;

    fn perform_operation(&mut self) -> Result<String, OperationError> {
        let inner = self.inner.perform_locally()?;
        Ok(format!("nested {inner}"))
    }
}

#[fixture]
fn inline() -> InlineQueuer {
    let mut registry = OperationRegistry::with_builtins();
    registry
        .register::<Guarded>()
        .expect("register guarded")
        .register::<Nested>()
        .expect("register nested");
    InlineQueuer { registry }
}

#[rstest]
fn perform_returns_the_output(inline: InlineQueuer) {
    let output = Echo::new("hello").perform(&inline).expect("perform");
    assert_eq!(output, "hello");
}

#[rstest]
fn perform_surfaces_operation_failure(inline: InlineQueuer) {
    let error = Fail::new("bad input").perform(&inline).expect_err("failure");
    assert_eq!(error, OperationError::failed("bad input"));
}

#[rstest]
fn pre_dispatch_hook_failure_is_the_outcome(inline: InlineQueuer) {
    let error = Guarded { allowed: false }
        .perform(&inline)
        .expect_err("hook failure");
    assert_eq!(error, OperationError::failed("refused before dispatch"));
    assert!(Guarded { allowed: true }.perform(&inline).expect("allowed"));
}

#[rstest]
fn background_target_gets_the_operation_back(inline: InlineQueuer) {
    let (target, receiver) = channel_target::<Echo>();
    Echo::new("later")
        .perform_in_background(&inline, target)
        .expect("submit");
    let (operation, outcome) = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("notification");
    assert_eq!(operation, Echo::new("later"));
    assert_eq!(outcome, Ok("later".to_string()));
}

#[rstest]
fn rejected_submission_does_not_notify() {
    let (target, receiver) = channel_target::<Echo>();
    let error = Echo::new("x")
        .perform_in_background(&RejectingQueuer, target)
        .expect_err("rejected");
    assert_eq!(error, OperationError::QueueFull { limit: 0 });
    assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
}

#[rstest]
fn dropped_submission_is_reported_as_abandoned() {
    let queuer = HoldingQueuer::default();
    let (target, receiver) = channel_target::<Echo>();
    Echo::new("lost")
        .perform_in_background(&queuer, target)
        .expect("submit");
    queuer.held.lock().expect("held lock").clear();

    let (_, outcome) = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("notification");
    assert_eq!(outcome, Err(OperationError::Abandoned));
}

#[rstest]
fn bounded_wait_gives_up() {
    let queuer = HoldingQueuer::default();
    let error = Echo::new("slow")
        .perform_with_timeout(&queuer, Duration::from_millis(50))
        .expect_err("wait timeout");
    assert_eq!(error, OperationError::WaitTimedOut { waited_ms: 50 });
    assert_eq!(queuer.held.lock().expect("held lock").len(), 1);
}

#[rstest]
fn local_execution_requires_a_worker_thread() {
    assert!(!is_worker_thread());
    let error = Echo::new("x").perform_locally().expect_err("not a worker");
    assert_eq!(error, OperationError::NotInWorker);

    let guard = WorkerThreadGuard::enter();
    assert_eq!(Echo::new("x").perform_locally().expect("local"), "x");
    drop(guard);
    assert!(!is_worker_thread());
}

#[rstest]
fn operations_compose_on_worker_threads(inline: InlineQueuer) {
    let nested = Nested {
        inner: Echo::new("inner"),
    };
    // The inline queuer runs on a non-worker thread, so the inner call fails.
    let error = nested.perform(&inline).expect_err("not a worker");
    assert_eq!(error, OperationError::NotInWorker);

    let _guard = WorkerThreadGuard::enter();
    let nested = Nested {
        inner: Echo::new("inner"),
    };
    assert_eq!(nested.perform(&inline).expect("nested"), "nested inner");
}

#[rstest]
fn default_queuer_is_installed_once(inline: InlineQueuer) {
    let queuer: Arc<dyn OpQueuer> = Arc::new(inline);
    assert!(set_default_queuer(Arc::clone(&queuer)));
    assert!(!set_default_queuer(queuer));
    let output = Echo::new("default")
        .perform_with_default_queuer()
        .expect("perform");
    assert_eq!(output, "default");
}

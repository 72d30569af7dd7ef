//! Behavioural tests for dispatcher admission and assignment policies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use crate::dispatcher::{
    ApplicationId, Assignment, Dispatcher, Policy, WorkerHandle, WorkerState,
};
use crate::operation::builtin::Echo;
use crate::operation::{Operation, OperationError, ResultRecord};
use crate::transport::WorkerWaker;

use super::support::channel_target;

struct SilentWaker;

impl WorkerWaker for SilentWaker {
    fn wake(&self) {}

    fn clear(&self) {}
}

#[derive(Default)]
struct DispatchWorld {
    dispatcher: Option<Arc<Dispatcher>>,
    handles: HashMap<usize, WorkerHandle>,
    assignments: HashMap<usize, Option<Assignment>>,
    last_submission: Option<Result<(), OperationError>>,
}

impl DispatchWorld {
    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.dispatcher.as_ref().expect("dispatcher configured")
    }

    fn connect(&mut self, worker: usize) {
        let handle = self
            .dispatcher()
            .worker_connected(worker, Arc::new(SilentWaker))
            .expect("worker connects");
        self.handles.insert(worker, handle);
    }

    fn handle(&self, worker: usize) -> WorkerHandle {
        *self.handles.get(&worker).expect("worker connected")
    }

    fn take_assignment(&mut self, worker: usize) -> Assignment {
        self.assignments
            .remove(&worker)
            .flatten()
            .expect("worker holds an assignment")
    }
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"')
}

#[fixture]
fn world() -> RefCell<DispatchWorld> {
    RefCell::new(DispatchWorld::default())
}

#[given(
    "a dispatcher with {workers} workers, {max_ops} operation per application and a queue of {max_queue}"
)]
fn given_dispatcher(world: &RefCell<DispatchWorld>, workers: usize, max_ops: usize, max_queue: usize) {
    let policy = Policy::new(workers, max_ops, max_queue).expect("valid policy");
    world.borrow_mut().dispatcher = Some(Arc::new(Dispatcher::new(policy)));
}

#[given("worker {worker} is connected")]
fn given_worker_connected(world: &RefCell<DispatchWorld>, worker: usize) {
    world.borrow_mut().connect(worker);
}

#[when("application {application} submits {count} operations")]
fn when_application_submits(world: &RefCell<DispatchWorld>, application: String, count: usize) {
    let mut world = world.borrow_mut();
    let queuer = world.dispatcher().queuer(unquote(&application));
    for index in 0..count {
        let (target, _outcomes) = channel_target::<Echo>();
        let result = Echo::new(format!("{application}-{index}")).perform_in_background(&queuer, target);
        world.last_submission = Some(result);
    }
}

#[when("worker {worker} asks for work")]
fn when_worker_asks(world: &RefCell<DispatchWorld>, worker: usize) {
    let mut world = world.borrow_mut();
    let handle = world.handle(worker);
    let assignment = world.dispatcher().next_work(handle).expect("next work");
    world.assignments.insert(worker, assignment);
}

#[when("worker {worker} completes its operation")]
fn when_worker_completes(world: &RefCell<DispatchWorld>, worker: usize) {
    let mut world = world.borrow_mut();
    let handle = world.handle(worker);
    let assignment = world.take_assignment(worker);
    let record = ResultRecord::encode::<Echo>(&"done".to_owned()).expect("encode result");
    world
        .dispatcher()
        .finished_work(handle, assignment, Ok(record), WorkerState::Ok)
        .expect("finish work");
}

#[when("worker {worker} returns its operation unacknowledged")]
fn when_worker_returns(world: &RefCell<DispatchWorld>, worker: usize) {
    let mut world = world.borrow_mut();
    let handle = world.handle(worker);
    let assignment = world.take_assignment(worker);
    world
        .dispatcher()
        .return_work(handle, assignment, WorkerState::Failed)
        .expect("return work");
}

#[when("worker {worker} reconnects")]
fn when_worker_reconnects(world: &RefCell<DispatchWorld>, worker: usize) {
    world.borrow_mut().connect(worker);
}

#[then("application {application} has {count} operation running")]
fn then_running(world: &RefCell<DispatchWorld>, application: String, count: usize) {
    let world = world.borrow();
    let running = world
        .dispatcher()
        .in_flight_for(&ApplicationId::from(unquote(&application)))
        .expect("in-flight count");
    assert_eq!(running, count);
}

#[then("{count} operations are queued")]
fn then_queued(world: &RefCell<DispatchWorld>, count: usize) {
    let queued = world.borrow().dispatcher().queue_len().expect("queue length");
    assert_eq!(queued, count);
}

#[then("worker {worker} was given nothing")]
fn then_given_nothing(world: &RefCell<DispatchWorld>, worker: usize) {
    let world = world.borrow();
    assert!(
        matches!(world.assignments.get(&worker), Some(None)),
        "worker {worker} should have been left idle"
    );
}

#[then("worker {worker} is running work for application {application}")]
fn then_running_for(world: &RefCell<DispatchWorld>, worker: usize, application: String) {
    let world = world.borrow();
    let assignment = world
        .assignments
        .get(&worker)
        .and_then(Option::as_ref)
        .expect("worker holds an assignment");
    assert_eq!(assignment.application().as_str(), unquote(&application));
}

#[then("the last submission was rejected because the queue is full")]
fn then_rejected(world: &RefCell<DispatchWorld>) {
    let world = world.borrow();
    assert_eq!(
        world.last_submission,
        Some(Err(OperationError::QueueFull { limit: 2 }))
    );
}

#[scenario(path = "tests/features/dispatcher.feature")]
fn dispatcher_policies(#[from(world)] world: RefCell<DispatchWorld>) {
    drop(world);
}

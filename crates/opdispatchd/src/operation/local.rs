//! Marks threads that execute operations on behalf of a worker.

use std::cell::Cell;

thread_local! {
    static WORKER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Permits [`Operation::perform_locally`](super::Operation::perform_locally)
/// on the calling thread.
pub fn mark_thread_as_worker() {
    WORKER_THREAD.with(|flag| flag.set(true));
}

pub fn unmark_thread_as_worker() {
    WORKER_THREAD.with(|flag| flag.set(false));
}

#[must_use]
pub fn is_worker_thread() -> bool {
    WORKER_THREAD.with(Cell::get)
}

/// Clears the worker marker when dropped.
#[derive(Debug)]
pub(crate) struct WorkerThreadGuard;

impl WorkerThreadGuard {
    pub(crate) fn enter() -> Self {
        mark_thread_as_worker();
        Self
    }
}

impl Drop for WorkerThreadGuard {
    fn drop(&mut self) {
        unmark_thread_as_worker();
    }
}

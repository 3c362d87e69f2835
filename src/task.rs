//! The opaque unit of work owned by the pool.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// A pool-owned unit of deferred work.
///
/// A task is owned exclusively by the queue until a worker claims it, then
/// exclusively by that worker until execution completes. `execute` consumes
/// the box, so a task runs at most once.
pub trait Task: Send {
    /// Performs the work.
    fn execute(self: Box<Self>);

    /// Short description used in worker-loop diagnostics.
    fn describe(&self) -> &str {
        "task"
    }
}

impl<F> Task for F
where
    F: FnOnce() + Send,
{
    fn execute(self: Box<Self>) {
        (*self)();
    }
}

/// Runs a task, containing any panic so the worker thread survives.
///
/// Returns the stringified panic payload when the task panicked. The pool's
/// thread count is invariant: a failing task never shrinks the pool.
pub(crate) fn execute_contained(task: Box<dyn Task>) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(move || task.execute()))
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// Stringifies a caught panic payload for error normalization.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

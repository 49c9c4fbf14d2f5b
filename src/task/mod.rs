//! Task representation and the panic boundary.

pub mod group;

pub use group::TaskGroup;

use group::GroupScope;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process;
use std::sync::Arc;

/// Callback invoked with the captured payload when a task body panics.
pub type ErrorHandler = Arc<dyn Fn(TaskError) + Send + Sync>;

/// A one-shot unit of work.
///
/// Carries a boxed callable, an optional [`TaskGroup`] binding and an
/// optional panic handler. Moving the task transfers the unique right to
/// execute it; the callable runs at most once. A task that is dropped
/// without running (shutdown drains, for example) still releases its group.
pub struct Task {
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
    group: Option<TaskGroup>,
    on_error: Option<ErrorHandler>,
}

impl Task {
    /// Create a task with no group binding.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Some(Box::new(f)),
            group: None,
            on_error: None,
        }
    }

    /// Create a task bound to `group`. The group's outstanding count rises
    /// immediately and falls when the task is destroyed.
    pub fn with_group<F>(f: F, group: TaskGroup) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        group.on_task_created();
        Self {
            func: Some(Box::new(f)),
            group: Some(group),
            on_error: None,
        }
    }

    /// Attach a panic handler consuming the captured payload.
    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Run the callable, routing a panic to the task's own handler.
    pub(crate) fn run(self) {
        self.run_with(None)
    }

    /// Run the callable; `fallback` handles a panic when the task carries no
    /// handler of its own. With neither, the process aborts: losing a task
    /// silently is worse than dying loudly.
    pub(crate) fn run_with(mut self, fallback: Option<&ErrorHandler>) {
        let Some(func) = self.func.take() else {
            return;
        };
        let _scope = GroupScope::enter(self.group.clone());
        if let Err(payload) = catch_unwind(AssertUnwindSafe(func)) {
            match self.on_error.as_ref().or(fallback) {
                Some(handler) => handler(TaskError::new(payload)),
                None => {
                    eprintln!("weft: task panicked with no handler installed, aborting");
                    process::abort();
                }
            }
        }
        // The group is released when `self` drops, executed or not.
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            group.on_task_done();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("executed", &self.func.is_none())
            .field("has_group", &self.group.is_some())
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}

/// Captured payload of a panicking task body.
pub struct TaskError {
    payload: Box<dyn Any + Send>,
}

impl TaskError {
    fn new(payload: Box<dyn Any + Send>) -> Self {
        Self { payload }
    }

    /// Best-effort human-readable message.
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "task panicked"
        }
    }

    /// The raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskError")
            .field("message", &self.message())
            .finish()
    }
}

//! Leaf executors over the task system.

use super::{Executor, ExecutorHandle};
use crate::runtime;
use crate::scheduler::spawn::submit;
use crate::task::Task;
use std::sync::Arc;

/// Enqueues into the process-global task system, initialising it with
/// default configuration on first use.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalExecutor;

impl Executor for GlobalExecutor {
    fn execute(&self, task: Task) {
        runtime::global().enqueue(task);
    }
}

/// A shared handle to the global executor.
pub fn global_executor() -> ExecutorHandle {
    Arc::new(GlobalExecutor)
}

/// Spawns on the current worker's deque and wakes a parked worker, so the
/// task starts as soon as a thread is free.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnExecutor;

impl Executor for SpawnExecutor {
    fn execute(&self, task: Task) {
        submit(task, true);
    }
}

/// Spawns on the current worker's deque without waking anyone. Meant for
/// continuations of the running task: the current thread picks them up next,
/// keeping the work hot instead of re-entering the general queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnContinuationExecutor;

impl Executor for SpawnContinuationExecutor {
    fn execute(&self, task: Task) {
        submit(task, false);
    }
}

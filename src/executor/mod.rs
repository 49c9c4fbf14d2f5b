//! Executors: objects that accept a task and arrange its eventual execution.
//!
//! Leaf executors hand tasks straight to a task system. Constraint executors
//! hold their own FIFOs, admit according to a policy (one at a time, N at a
//! time, readers/writers) and re-post admitted tasks into a wrapped base
//! executor.

pub mod global;
pub mod n_serializer;
pub mod rw_serializer;
pub mod serializer;

pub use global::{global_executor, GlobalExecutor, SpawnContinuationExecutor, SpawnExecutor};
pub use n_serializer::NSerializer;
pub use rw_serializer::{RwReader, RwSerializer, RwWriter};
pub use serializer::Serializer;

use crate::task::Task;
use std::sync::Arc;

/// Something that accepts one task per call and eventually executes it.
///
/// Submission is infallible; there is no completion signal beyond what the
/// task itself does. Handles are shared as `Arc<dyn Executor>`.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);

    /// Wrap a closure into a task and submit it.
    fn execute_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.execute(Task::new(f));
    }
}

/// Shared, type-erased executor handle.
pub type ExecutorHandle = Arc<dyn Executor>;

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}

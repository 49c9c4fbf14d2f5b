//! At-most-one executor.

use super::{Executor, ExecutorHandle, SpawnContinuationExecutor};
use crate::queue::ConcurrentDeque;
use crate::task::{ErrorHandler, Task};
use crate::util::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const PENDING_QUEUE_CAPACITY: usize = 256;

/// Executes its tasks one at a time, in submission order, on top of a base
/// executor.
///
/// Submission never blocks: tasks wait in an internal FIFO and a single
/// drain task walks it. When a burst starts the drain goes through the base
/// executor (which may wake the runtime); between tasks of a burst it goes
/// through the continuation executor, which by default chains on the worker
/// that just finished, keeping the batch hot.
///
/// A task that panics is reported through its own handler, or this
/// serializer's, and the serializer moves on to the next pending task.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<SerializerInner>,
}

struct SerializerInner {
    base: ExecutorHandle,
    cont: ExecutorHandle,
    on_error: Option<ErrorHandler>,
    queue: ConcurrentDeque<Task>,
    // Submitted-but-unfinished count. Zero means no drain task is in
    // flight; the transition 0 -> 1 elects the submitter that posts one.
    count: AtomicU32,
}

impl Serializer {
    /// Serialize on top of `base`. Continuations chain through
    /// [`SpawnContinuationExecutor`].
    pub fn new(base: ExecutorHandle) -> Self {
        Self::with_continuation(base, Arc::new(SpawnContinuationExecutor))
    }

    /// Serialize on top of `base`, chaining pending tasks through `cont`.
    pub fn with_continuation(base: ExecutorHandle, cont: ExecutorHandle) -> Self {
        Self {
            inner: Arc::new(SerializerInner {
                base,
                cont,
                on_error: None,
                queue: ConcurrentDeque::new(PENDING_QUEUE_CAPACITY),
                count: AtomicU32::new(0),
            }),
        }
    }

    /// Install a handler for tasks that panic without one of their own.
    /// Call before sharing the serializer.
    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("on_error must be called before the serializer is shared");
        inner.on_error = Some(handler);
        self
    }
}

impl Executor for Serializer {
    fn execute(&self, task: Task) {
        self.inner.submit(task);
    }
}

impl SerializerInner {
    fn submit(self: &Arc<Self>, task: Task) {
        self.queue.push_back(task);
        if self.count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.base.execute(self.drain_task());
        }
    }

    fn drain_task(self: &Arc<Self>) -> Task {
        let inner = Arc::clone(self);
        Task::new(move || inner.run_one())
    }

    fn run_one(self: &Arc<Self>) {
        // The count went positive only after the corresponding push
        // completed, so the pop can at worst wait out a publication.
        let mut backoff = Backoff::new();
        let task = loop {
            match self.queue.try_pop_front() {
                Some(task) => break task,
                None => backoff.pause(),
            }
        };
        task.run_with(self.on_error.as_ref());
        if self.count.fetch_sub(1, Ordering::AcqRel) > 1 {
            self.cont.execute(self.drain_task());
        }
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("pending", &self.inner.count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::TaskSystem;
    use crate::task::TaskGroup;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn small_system() -> TaskSystem {
        let config = Config::builder().worker_threads(4).build().unwrap();
        TaskSystem::new(config).unwrap()
    }

    #[test]
    fn test_executes_all_tasks() {
        let system = small_system();
        let serializer = Serializer::new(system.executor());
        let group = TaskGroup::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = count.clone();
            serializer.execute(Task::with_group(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        assert_eq!(count.load(Ordering::SeqCst), 10);
        system.shutdown();
    }

    #[test]
    fn test_runs_in_submission_order() {
        let system = small_system();
        let serializer = Serializer::new(system.executor());
        let group = TaskGroup::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            serializer.execute(Task::with_group(
                move || {
                    order.lock().push(i);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
        system.shutdown();
    }

    #[test]
    fn test_never_two_bodies_at_once() {
        let system = small_system();
        let serializer = Serializer::new(system.executor());
        let group = TaskGroup::new();
        let in_body = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let in_body = in_body.clone();
            let max_seen = max_seen.clone();
            serializer.execute(Task::with_group(
                move || {
                    let now = in_body.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    in_body.fetch_sub(1, Ordering::SeqCst);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        system.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_stall_the_rest() {
        let system = small_system();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        let handler: ErrorHandler = Arc::new(move |err| {
            assert_eq!(err.message(), "task five failed");
            e.fetch_add(1, Ordering::SeqCst);
        });
        let serializer = Serializer::new(system.executor()).on_error(handler);
        let group = TaskGroup::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            serializer.execute(Task::with_group(
                move || {
                    if i == 5 {
                        panic!("task five failed");
                    }
                    order.lock().push(i);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
        system.shutdown();
    }

    #[test]
    fn test_all_panicking_tasks_reach_the_handler() {
        let system = small_system();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        let handler: ErrorHandler = Arc::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        let serializer = Serializer::new(system.executor()).on_error(handler);
        let group = TaskGroup::new();

        for _ in 0..10 {
            serializer.execute(Task::with_group(|| panic!("boom"), group.clone()));
        }
        system.busy_wait_on(&group);

        assert_eq!(errors.load(Ordering::SeqCst), 10);
        system.shutdown();
    }
}

//! Bounded-parallelism executor.

use super::{Executor, ExecutorHandle, SpawnContinuationExecutor};
use crate::queue::ConcurrentDeque;
use crate::task::{ErrorHandler, Task};
use crate::util::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const PENDING_QUEUE_CAPACITY: usize = 256;

/// Executes at most `n` of its tasks concurrently, admitting in FIFO order.
///
/// The count of submitted-but-unfinished tasks doubles as the admission
/// state: a submission that finds fewer than `n` in the system posts a drain
/// task; a completion that leaves `n` or more behind posts a replacement.
/// At any instant `min(count, n)` drain tasks are in flight, each running
/// one pending task at a time. With `n == 1` this is exactly a
/// [`Serializer`](super::Serializer).
#[derive(Clone)]
pub struct NSerializer {
    inner: Arc<NSerializerInner>,
}

struct NSerializerInner {
    base: ExecutorHandle,
    cont: ExecutorHandle,
    on_error: Option<ErrorHandler>,
    queue: ConcurrentDeque<Task>,
    count: AtomicU32,
    max_parallelism: u32,
}

impl NSerializer {
    /// Admit at most `max_parallelism` tasks at a time on top of `base`.
    pub fn new(base: ExecutorHandle, max_parallelism: u32) -> Self {
        Self::with_continuation(base, max_parallelism, Arc::new(SpawnContinuationExecutor))
    }

    pub fn with_continuation(
        base: ExecutorHandle,
        max_parallelism: u32,
        cont: ExecutorHandle,
    ) -> Self {
        assert!(max_parallelism > 0, "max_parallelism must be at least 1");
        Self {
            inner: Arc::new(NSerializerInner {
                base,
                cont,
                on_error: None,
                queue: ConcurrentDeque::new(PENDING_QUEUE_CAPACITY),
                count: AtomicU32::new(0),
                max_parallelism,
            }),
        }
    }

    /// Install a handler for tasks that panic without one of their own.
    /// Call before sharing the executor.
    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("on_error must be called before the n-serializer is shared");
        inner.on_error = Some(handler);
        self
    }

    pub fn max_parallelism(&self) -> u32 {
        self.inner.max_parallelism
    }
}

impl Executor for NSerializer {
    fn execute(&self, task: Task) {
        self.inner.submit(task);
    }
}

impl NSerializerInner {
    fn submit(self: &Arc<Self>, task: Task) {
        self.queue.push_back(task);
        if self.count.fetch_add(1, Ordering::AcqRel) < self.max_parallelism {
            self.base.execute(self.drain_task());
        }
    }

    fn drain_task(self: &Arc<Self>) -> Task {
        let inner = Arc::clone(self);
        Task::new(move || inner.run_one())
    }

    fn run_one(self: &Arc<Self>) {
        let mut backoff = Backoff::new();
        let task = loop {
            match self.queue.try_pop_front() {
                Some(task) => break task,
                None => backoff.pause(),
            }
        };
        task.run_with(self.on_error.as_ref());
        if self.count.fetch_sub(1, Ordering::AcqRel) > self.max_parallelism {
            self.cont.execute(self.drain_task());
        }
    }
}

impl fmt::Debug for NSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NSerializer")
            .field("max_parallelism", &self.inner.max_parallelism)
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

    fn system_with(workers: usize) -> TaskSystem {
        let config = Config::builder().worker_threads(workers).build().unwrap();
        TaskSystem::new(config).unwrap()
    }

    #[test]
    fn test_executes_all_tasks() {
        let system = system_with(4);
        let nser = NSerializer::new(system.executor(), 4);
        let group = TaskGroup::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..40 {
            let count = count.clone();
            nser.execute(Task::with_group(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        assert_eq!(count.load(Ordering::SeqCst), 40);
        system.shutdown();
    }

    #[test]
    fn test_parallelism_stays_within_bound() {
        let system = system_with(8);
        let nser = NSerializer::new(system.executor(), 4);
        let group = TaskGroup::new();
        let in_body = Arc::new(AtomicUsize::new(0));
        let samples = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..10 {
            let in_body = in_body.clone();
            let samples = samples.clone();
            nser.execute(Task::with_group(
                move || {
                    in_body.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    samples.lock().push(in_body.load(Ordering::SeqCst));
                    std::thread::sleep(Duration::from_millis(1));
                    in_body.fetch_sub(1, Ordering::SeqCst);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);
        assert_eq!(in_body.load(Ordering::SeqCst), 0);

        let samples = samples.lock();
        assert_eq!(samples.len(), 10);
        assert!(samples.iter().all(|&p| p <= 4), "samples: {samples:?}");
        if num_cpus::get() >= 4 {
            assert!(
                samples.iter().any(|&p| p >= 2),
                "expected some overlap, samples: {samples:?}"
            );
        }
        system.shutdown();
    }

    #[test]
    fn test_n_equal_one_preserves_order() {
        let system = system_with(4);
        let nser = NSerializer::new(system.executor(), 1);
        let group = TaskGroup::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            nser.execute(Task::with_group(
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
    fn test_panics_reach_the_handler() {
        let system = system_with(4);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        let handler: ErrorHandler = Arc::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        let nser = NSerializer::new(system.executor(), 4).on_error(handler);
        let group = TaskGroup::new();

        for _ in 0..10 {
            nser.execute(Task::with_group(|| panic!("boom"), group.clone()));
        }
        system.busy_wait_on(&group);

        assert_eq!(errors.load(Ordering::SeqCst), 10);
        system.shutdown();
    }
}

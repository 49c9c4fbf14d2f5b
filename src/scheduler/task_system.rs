//! The central coordinator: worker threads, their deques, and the waiting
//! machinery that turns any thread into a temporary worker.

use crate::config::Config;
use crate::error::Result;
use crate::executor::{Executor, ExecutorHandle};
use crate::task::{Task, TaskGroup};
use crate::util::{Backoff, CachePadded};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::worker::{self, WorkerSlot};

thread_local! {
    // Stack of (system, slot) pairs; the top entry is the worker identity of
    // this thread. A stack because busy-waiting nests.
    static CURRENT: RefCell<Vec<(Weak<SystemInner>, Arc<WorkerSlot>)>> =
        const { RefCell::new(Vec::new()) };
}

/// RAII registration of the calling thread as a worker of `inner`.
pub(crate) struct CurrentWorker(());

impl CurrentWorker {
    pub(crate) fn install(inner: &Arc<SystemInner>, slot: Arc<WorkerSlot>) -> Self {
        CURRENT.with(|c| c.borrow_mut().push((Arc::downgrade(inner), slot)));
        CurrentWorker(())
    }
}

impl Drop for CurrentWorker {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });
    }
}

/// The slot of the calling thread, when it is currently a worker of `inner`.
pub(crate) fn current_slot_for(inner: &Arc<SystemInner>) -> Option<Arc<WorkerSlot>> {
    CURRENT.with(|c| {
        c.borrow().last().and_then(|(system, slot)| {
            let system = system.upgrade()?;
            Arc::ptr_eq(&system, inner).then(|| slot.clone())
        })
    })
}

/// The system the calling thread is currently working for, if any.
pub(crate) fn current_system() -> Option<Arc<SystemInner>> {
    CURRENT.with(|c| c.borrow().last().and_then(|(system, _)| system.upgrade()))
}

pub(crate) struct SystemInner {
    slots: Vec<Arc<WorkerSlot>>,
    // Transient slots of busy-waiting threads; stealable like any other.
    extra_slots: RwLock<Vec<Arc<WorkerSlot>>>,
    running: AtomicBool,
    next_enqueue: CachePadded<AtomicUsize>,
    deque_capacity: usize,
}

impl SystemInner {
    pub(crate) fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: usize) -> &Arc<WorkerSlot> {
        &self.slots[index]
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn any_work(&self) -> bool {
        if self.slots.iter().any(|slot| !slot.deque.is_empty()) {
            return true;
        }
        self.extra_slots
            .read()
            .iter()
            .any(|slot| !slot.deque.is_empty())
    }

    /// Push one task into the system. From one of this system's workers the
    /// task lands at the back of that worker's own deque; from anywhere else
    /// the fixed workers are targeted round-robin.
    pub(crate) fn enqueue(self: &Arc<Self>, task: Task) {
        assert!(
            self.is_running(),
            "task submitted to a shut-down task system"
        );
        match current_slot_for(self) {
            Some(slot) => slot.deque.push_back(task),
            None => {
                let index = self.next_enqueue.fetch_add(1, Ordering::Relaxed) % self.slots.len();
                self.slots[index].deque.push_back(task);
            }
        }
        self.wake_one();
    }

    /// Round-robin push that never panics; used where a panic would unwind a
    /// destructor. After shutdown the task just waits to be drained.
    pub(crate) fn requeue(&self, task: Task) {
        let index = self.next_enqueue.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[index].deque.push_back(task);
        self.wake_one();
    }

    /// Push at the front of the current worker's deque for LIFO locality.
    /// Off a worker thread this degrades to `enqueue`.
    pub(crate) fn spawn_local(self: &Arc<Self>, task: Task, wake_workers: bool) {
        match current_slot_for(self) {
            Some(slot) => {
                assert!(
                    self.is_running(),
                    "task submitted to a shut-down task system"
                );
                slot.deque.push_front(task);
                if wake_workers {
                    self.wake_one();
                }
            }
            None => self.enqueue(task),
        }
    }

    pub(crate) fn try_steal(
        &self,
        me: &Arc<WorkerSlot>,
        rng: &mut rand::rngs::SmallRng,
    ) -> Option<Task> {
        let n = self.slots.len();
        let offset = rng.gen_range(0..n);
        for i in 0..n {
            let victim = &self.slots[(offset + i) % n];
            if Arc::ptr_eq(victim, me) {
                continue;
            }
            if let Some(task) = victim.deque.try_pop_back() {
                return Some(task);
            }
        }
        let extras = self.extra_slots.read();
        for victim in extras.iter() {
            if Arc::ptr_eq(victim, me) {
                continue;
            }
            if let Some(task) = victim.deque.try_pop_back() {
                return Some(task);
            }
        }
        None
    }

    /// Wake one parked worker. The fence pairs with the one in the park
    /// path: a producer either observes the sleeping flag, or the parking
    /// worker's re-scan observes the freshly pushed task.
    pub(crate) fn wake_one(&self) {
        fence(Ordering::SeqCst);
        for slot in &self.slots {
            if slot.sleeping.swap(false, Ordering::AcqRel) {
                slot.unpark();
                return;
            }
        }
    }

    pub(crate) fn wake_all(&self) {
        for slot in &self.slots {
            slot.sleeping.store(false, Ordering::SeqCst);
            slot.unpark();
        }
    }

    /// Make the calling thread a worker of this system. Re-entrant: a thread
    /// that already is one gets a guard over its existing slot.
    pub(crate) fn enter_worker(self: &Arc<Self>) -> WorkerGuard {
        if let Some(slot) = current_slot_for(self) {
            return WorkerGuard {
                inner: self.clone(),
                slot,
                registration: None,
                transient: false,
            };
        }
        let slot = Arc::new(WorkerSlot::new(self.deque_capacity));
        self.extra_slots.write().push(slot.clone());
        let registration = CurrentWorker::install(self, slot.clone());
        WorkerGuard {
            inner: self.clone(),
            slot,
            registration: Some(registration),
            transient: true,
        }
    }

    fn remove_extra_slot(&self, slot: &Arc<WorkerSlot>) {
        self.extra_slots
            .write()
            .retain(|candidate| !Arc::ptr_eq(candidate, slot));
    }

    /// Run tasks on the calling thread until the group has no outstanding
    /// tasks. The waiter pops its own deque, then steals, so progress does
    /// not depend on any other worker being alive.
    pub(crate) fn busy_wait_on(self: &Arc<Self>, group: &TaskGroup) {
        if group.is_done() {
            return;
        }
        let guard = self.enter_worker();
        let slot = guard.slot.clone();
        let mut rng = worker::steal_rng(self.slots.len() + 1);
        let mut backoff = Backoff::new();
        while !group.is_done() {
            let task = slot
                .deque
                .try_pop_front()
                .or_else(|| self.try_steal(&slot, &mut rng));
            match task {
                Some(task) => {
                    backoff.reset();
                    task.run();
                    slot.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
                }
                None => backoff.pause(),
            }
        }
    }
}

/// Opaque handle restoring the previous worker identity of a thread.
///
/// Returned by [`TaskSystem::enter_worker`]; dropping it (or passing it to
/// [`TaskSystem::exit_worker`]) removes the transient registration. Guards
/// nest; drop them in reverse order of creation.
pub struct WorkerGuard {
    inner: Arc<SystemInner>,
    slot: Arc<WorkerSlot>,
    registration: Option<CurrentWorker>,
    transient: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.transient {
            return;
        }
        // Pop the registration first so the re-enqueue below targets the
        // fixed workers, not the slot being torn down.
        self.registration.take();
        self.inner.remove_extra_slot(&self.slot);
        while let Some(task) = self.slot.deque.try_pop_front() {
            if self.inner.is_running() {
                self.inner.requeue(task);
            } else {
                drop(task);
            }
        }
    }
}

impl fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGuard")
            .field("transient", &self.transient)
            .finish()
    }
}

/// Aggregate worker counters, sampled by [`TaskSystem::stats`].
#[derive(Debug, Default, Clone)]
pub struct SystemStats {
    pub tasks_executed: u64,
    pub tasks_stolen: u64,
    pub times_parked: u64,
    pub overflow_hits: u64,
}

/// A fixed pool of worker threads executing [`Task`]s from per-worker
/// deques, with random back-of-deque stealing.
pub struct TaskSystem {
    inner: Arc<SystemInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: Config,
}

impl TaskSystem {
    /// Spawn the worker pool described by `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let worker_count = config.worker_count();
        let inner = Arc::new(SystemInner {
            slots: (0..worker_count)
                .map(|_| Arc::new(WorkerSlot::new(config.deque_capacity)))
                .collect(),
            extra_slots: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
            next_enqueue: CachePadded::new(AtomicUsize::new(0)),
            deque_capacity: config.deque_capacity,
        });

        let mut threads = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_inner = Arc::clone(&inner);
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, index));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || worker::worker_loop(worker_inner, index))
                .map_err(|e| {
                    // Already-spawned workers observe the cleared flag and
                    // exit on their next loop iteration.
                    inner.running.store(false, Ordering::Release);
                    crate::error::Error::from(e)
                })?;
            threads.push(handle);
        }

        Ok(Self {
            inner,
            threads: Mutex::new(threads),
            config,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// An executor handle that enqueues into this system.
    pub fn executor(&self) -> ExecutorHandle {
        Arc::new(SystemExecutor {
            inner: self.inner.clone(),
        })
    }

    /// Submit one task. Infallible; panics only after `shutdown`.
    pub fn enqueue(&self, task: Task) {
        self.inner.enqueue(task);
    }

    /// Push a task at the front of the current worker's deque. Freshly
    /// spawned continuations stay hot this way. `wake_workers` controls
    /// whether a parked worker is notified.
    pub fn spawn(&self, task: Task, wake_workers: bool) {
        self.inner.spawn_local(task, wake_workers);
    }

    /// Execute tasks on the calling thread until `group` has none
    /// outstanding. Returns immediately if the group is already done.
    pub fn busy_wait_on(&self, group: &TaskGroup) {
        self.inner.busy_wait_on(group);
    }

    /// Register the calling thread as a transient worker.
    pub fn enter_worker(&self) -> WorkerGuard {
        self.inner.enter_worker()
    }

    /// Remove a transient registration. Equivalent to dropping the guard.
    pub fn exit_worker(&self, guard: WorkerGuard) {
        drop(guard);
    }

    /// Snapshot of the fixed workers' counters.
    pub fn stats(&self) -> SystemStats {
        let mut stats = SystemStats::default();
        for slot in &self.inner.slots {
            stats.tasks_executed += slot.counters.tasks_executed.load(Ordering::Relaxed);
            stats.tasks_stolen += slot.counters.tasks_stolen.load(Ordering::Relaxed);
            stats.times_parked += slot.counters.times_parked.load(Ordering::Relaxed);
            stats.overflow_hits += slot.deque.overflow_count();
        }
        stats
    }

    /// Stop the workers, join them and drop whatever never ran. Dropped
    /// tasks still release their groups, so waiters cannot hang. Idempotent.
    /// Must not be called from one of this system's own workers.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.wake_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        for slot in &self.inner.slots {
            while slot.deque.try_pop_front().is_some() {}
        }
        let extras: Vec<_> = self.inner.extra_slots.read().clone();
        for slot in extras {
            while slot.deque.try_pop_front().is_some() {}
        }
    }

    pub(crate) fn inner(&self) -> &Arc<SystemInner> {
        &self.inner
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSystem")
            .field("worker_count", &self.worker_count())
            .field("running", &self.inner.is_running())
            .finish()
    }
}

struct SystemExecutor {
    inner: Arc<SystemInner>,
}

impl Executor for SystemExecutor {
    fn execute(&self, task: Task) {
        self.inner.enqueue(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn small_system() -> TaskSystem {
        let config = Config::builder().worker_threads(4).build().unwrap();
        TaskSystem::new(config).unwrap()
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        let system = small_system();
        let group = TaskGroup::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let count = count.clone();
            system.enqueue(Task::with_group(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert!(group.is_done());
        system.shutdown();
    }

    #[test]
    fn test_stats_count_executed_tasks() {
        let system = small_system();
        let (tx, rx) = crossbeam_channel::bounded(64);

        for _ in 0..64 {
            let tx = tx.clone();
            system.enqueue(Task::new(move || {
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..64 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        system.shutdown();

        assert_eq!(system.stats().tasks_executed, 64);
    }

    #[test]
    fn test_busy_wait_on_finished_group_returns_immediately() {
        let system = small_system();
        let group = TaskGroup::new();
        system.busy_wait_on(&group);
        system.busy_wait_on(&group);
        system.shutdown();
    }

    #[test]
    fn test_nested_groups_drain_together() {
        let system = small_system();
        let root = TaskGroup::new();
        let child = TaskGroup::with_parent(&root);

        for _ in 0..100 {
            let child = child.clone();
            let inner = system.inner().clone();
            system.enqueue(Task::with_group(
                move || {
                    for _ in 0..10 {
                        inner.spawn_local(Task::with_group(|| {}, child.clone()), true);
                    }
                },
                root.clone(),
            ));
        }
        system.busy_wait_on(&root);

        assert_eq!(root.active_tasks(), 0);
        assert_eq!(child.active_tasks(), 0);
        system.shutdown();
    }

    #[test]
    fn test_enter_worker_nests() {
        let system = small_system();
        let outer = system.enter_worker();
        let inner = system.enter_worker();
        system.exit_worker(inner);
        system.exit_worker(outer);
        assert!(current_system().is_none());
        system.shutdown();
    }

    #[test]
    fn test_transient_leftovers_are_reenqueued() {
        let system = small_system();
        let group = TaskGroup::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let guard = system.enter_worker();
            for _ in 0..10 {
                let count = count.clone();
                // Lands on the transient slot's deque.
                system.spawn(
                    Task::with_group(
                        move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        },
                        group.clone(),
                    ),
                    false,
                );
            }
            drop(guard);
        }
        system.busy_wait_on(&group);
        assert_eq!(count.load(Ordering::SeqCst), 10);
        system.shutdown();
    }

    #[test]
    fn test_shutdown_releases_queued_groups() {
        let system = small_system();
        let group = TaskGroup::new();
        for _ in 0..50 {
            system.enqueue(Task::with_group(|| {}, group.clone()));
        }
        system.shutdown();
        assert!(group.is_done());
    }

    #[test]
    #[should_panic(expected = "shut-down task system")]
    fn test_enqueue_after_shutdown_panics() {
        let system = small_system();
        system.shutdown();
        system.enqueue(Task::new(|| {}));
    }

    #[test]
    fn test_cancellation_is_observable_in_bodies() {
        let system = small_system();
        let group = TaskGroup::new();
        let skipped = Arc::new(AtomicUsize::new(0));

        group.cancel();
        for _ in 0..20 {
            let skipped = skipped.clone();
            system.enqueue(Task::with_group(
                move || {
                    let current = TaskGroup::current().unwrap();
                    if current.is_cancelled() {
                        skipped.fetch_add(1, Ordering::SeqCst);
                    }
                },
                group.clone(),
            ));
        }
        system.busy_wait_on(&group);

        // Queued tasks still ran; their bodies observed the flag.
        assert_eq!(skipped.load(Ordering::SeqCst), 20);
        system.shutdown();
    }
}

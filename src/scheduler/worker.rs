// Worker threads: pop-own-front, steal-others-back, park when dry.

use crate::queue::ConcurrentDeque;
use crate::task::Task;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::Duration;

use super::task_system::{self, SystemInner};

// Bounded park so a lost wake-up can only cost one interval.
const PARK_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct WorkerCounters {
    pub(crate) tasks_executed: AtomicU64,
    pub(crate) tasks_stolen: AtomicU64,
    pub(crate) times_parked: AtomicU64,
}

impl WorkerCounters {
    fn new() -> Self {
        Self {
            tasks_executed: AtomicU64::new(0),
            tasks_stolen: AtomicU64::new(0),
            times_parked: AtomicU64::new(0),
        }
    }
}

/// One worker's share of the task system: its deque, park state and
/// counters. Transient (busy-waiting) workers get one of these too.
pub(crate) struct WorkerSlot {
    pub(crate) deque: ConcurrentDeque<Task>,
    pub(crate) sleeping: AtomicBool,
    pub(crate) thread: OnceLock<Thread>,
    pub(crate) counters: WorkerCounters,
}

impl WorkerSlot {
    pub(crate) fn new(deque_capacity: usize) -> Self {
        Self {
            deque: ConcurrentDeque::new(deque_capacity),
            sleeping: AtomicBool::new(false),
            thread: OnceLock::new(),
            counters: WorkerCounters::new(),
        }
    }

    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

/// Per-worker steal RNG. Seeded deterministically per index; victim order
/// only needs to be decorrelated across workers, not unpredictable.
pub(crate) fn steal_rng(index: usize) -> SmallRng {
    SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(index as u64 + 1))
}

pub(crate) fn worker_loop(inner: Arc<SystemInner>, index: usize) {
    let slot = inner.slot(index).clone();
    let _ = slot.thread.set(thread::current());
    let _entered = task_system::CurrentWorker::install(&inner, slot.clone());

    let mut rng = steal_rng(index);
    // Misses before parking; scales with the pool so a brief dry spell on a
    // big machine still finds straggler queues.
    let steal_budget = (2 * inner.worker_count()).max(4);
    let mut misses = 0usize;

    while inner.is_running() {
        if let Some(task) = slot.deque.try_pop_front() {
            misses = 0;
            task.run();
            slot.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if let Some(task) = inner.try_steal(&slot, &mut rng) {
            misses = 0;
            slot.counters.tasks_stolen.fetch_add(1, Ordering::Relaxed);
            task.run();
            slot.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        misses += 1;
        if misses >= steal_budget {
            park(&inner, &slot);
            misses = 0;
        } else {
            thread::yield_now();
        }
    }
}

/// Check-then-block. The sleeping flag is published before the re-scan and
/// producers fence before reading it, so either the producer sees the flag
/// and unparks, or the re-scan sees the freshly pushed task.
fn park(inner: &SystemInner, slot: &WorkerSlot) {
    slot.sleeping.store(true, Ordering::SeqCst);
    fence(Ordering::SeqCst);
    if inner.any_work() || !inner.is_running() {
        slot.sleeping.store(false, Ordering::Relaxed);
        return;
    }
    slot.counters.times_parked.fetch_add(1, Ordering::Relaxed);
    thread::park_timeout(PARK_INTERVAL);
    slot.sleeping.store(false, Ordering::Relaxed);
}

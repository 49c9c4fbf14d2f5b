//! Multi-reader / single-writer executor, writers preferred.

use super::{Executor, ExecutorHandle, SpawnContinuationExecutor};
use crate::queue::ConcurrentDeque;
use crate::task::{ErrorHandler, Task};
use crate::util::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const PENDING_QUEUE_CAPACITY: usize = 256;

// All admission state lives in one word: two pending counts, the active
// reader count, the single-writer flag and the combiner-ownership bit.
// Keeping the counts together is what makes the ordering guarantees stick:
// any snapshot that includes a reader's pending increment also includes
// every write increment that preceded it.
const COUNT_MASK: u64 = 0xFFFF;
const READS_PENDING_SHIFT: u32 = 0;
const WRITES_PENDING_SHIFT: u32 = 16;
const READERS_ACTIVE_SHIFT: u32 = 32;
const WRITER_ACTIVE_BIT: u64 = 1 << 48;
const COMBINER_BIT: u64 = 1 << 49;

const ONE_READ_PENDING: u64 = 1 << READS_PENDING_SHIFT;
const ONE_WRITE_PENDING: u64 = 1 << WRITES_PENDING_SHIFT;
const ONE_READER_ACTIVE: u64 = 1 << READERS_ACTIVE_SHIFT;

#[derive(Clone, Copy)]
struct RwState {
    reads_pending: u64,
    writes_pending: u64,
    readers_active: u64,
    writer_active: bool,
}

impl RwState {
    fn decode(word: u64) -> Self {
        Self {
            reads_pending: (word >> READS_PENDING_SHIFT) & COUNT_MASK,
            writes_pending: (word >> WRITES_PENDING_SHIFT) & COUNT_MASK,
            readers_active: (word >> READERS_ACTIVE_SHIFT) & COUNT_MASK,
            writer_active: word & WRITER_ACTIVE_BIT != 0,
        }
    }

    fn can_admit_write(&self) -> bool {
        !self.writer_active && self.readers_active == 0 && self.writes_pending > 0
    }

    fn can_admit_read(&self) -> bool {
        !self.writer_active && self.writes_pending == 0 && self.reads_pending > 0
    }

    fn can_admit(&self) -> bool {
        self.can_admit_write() || self.can_admit_read()
    }
}

/// Binds a READ executor and a WRITE executor over a common base.
///
/// READ tasks may run in parallel with each other but never with a WRITE
/// task; WRITE tasks run alone, in submission order. Pending WRITEs bar new
/// READ admissions, so a burst of writes drains before the readers that
/// queued up behind it: readers usually want the latest write, and writes
/// are assumed rare.
///
/// `reader()` and `writer()` hand out cheap clones sharing this state.
#[derive(Clone)]
pub struct RwSerializer {
    inner: Arc<RwInner>,
}

struct RwInner {
    base: ExecutorHandle,
    cont: ExecutorHandle,
    on_error: Option<ErrorHandler>,
    read_queue: ConcurrentDeque<Task>,
    write_queue: ConcurrentDeque<Task>,
    state: AtomicU64,
}

impl RwSerializer {
    pub fn new(base: ExecutorHandle) -> Self {
        Self::with_continuation(base, Arc::new(SpawnContinuationExecutor))
    }

    pub fn with_continuation(base: ExecutorHandle, cont: ExecutorHandle) -> Self {
        Self {
            inner: Arc::new(RwInner {
                base,
                cont,
                on_error: None,
                read_queue: ConcurrentDeque::new(PENDING_QUEUE_CAPACITY),
                write_queue: ConcurrentDeque::new(PENDING_QUEUE_CAPACITY),
                state: AtomicU64::new(0),
            }),
        }
    }

    /// Install a handler for tasks that panic without one of their own.
    /// Call before sharing the serializer or its sub-executors.
    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("on_error must be called before the rw-serializer is shared");
        inner.on_error = Some(handler);
        self
    }

    /// The executor for READ tasks.
    pub fn reader(&self) -> RwReader {
        RwReader {
            inner: self.inner.clone(),
        }
    }

    /// The executor for WRITE tasks.
    pub fn writer(&self) -> RwWriter {
        RwWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Submits READ tasks to its parent [`RwSerializer`].
#[derive(Clone)]
pub struct RwReader {
    inner: Arc<RwInner>,
}

impl Executor for RwReader {
    fn execute(&self, task: Task) {
        self.inner.submit_read(task);
    }
}

/// Submits WRITE tasks to its parent [`RwSerializer`].
#[derive(Clone)]
pub struct RwWriter {
    inner: Arc<RwInner>,
}

impl Executor for RwWriter {
    fn execute(&self, task: Task) {
        self.inner.submit_write(task);
    }
}

impl RwInner {
    fn submit_read(self: &Arc<Self>, task: Task) {
        self.read_queue.push_back(task);
        self.state.fetch_add(ONE_READ_PENDING, Ordering::AcqRel);
        self.admit(false);
    }

    fn submit_write(self: &Arc<Self>, task: Task) {
        self.write_queue.push_back(task);
        self.state.fetch_add(ONE_WRITE_PENDING, Ordering::AcqRel);
        self.admit(false);
    }

    fn try_claim_combiner(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur & COMBINER_BIT == 0).then_some(cur | COMBINER_BIT)
            })
            .is_ok()
    }

    /// Dispatch pending tasks on behalf of everyone. A single combiner role,
    /// claimed through the state word: whoever holds the bit admits one
    /// writer when the serializer is idle, or drains readers while no write
    /// is pending, then releases. Submission-path admissions post through
    /// the base executor; completion-path ones through the continuation
    /// executor.
    fn admit(self: &Arc<Self>, from_completion: bool) {
        if !self.try_claim_combiner() {
            return;
        }
        let mut backoff = Backoff::new();
        loop {
            let snapshot = RwState::decode(self.state.load(Ordering::Acquire));
            if snapshot.can_admit_write() {
                // Pop before the state change; the pending count only went
                // up after the push, so at worst we wait out a publication.
                let Some(task) = self.write_queue.try_pop_front() else {
                    backoff.pause();
                    continue;
                };
                // Only the combiner moves pending into active, and readers
                // only retire concurrently, so the admission condition holds
                // through this update.
                let _ = self
                    .state
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                        Some((cur - ONE_WRITE_PENDING) | WRITER_ACTIVE_BIT)
                    });
                self.executor_for(from_completion)
                    .execute(self.write_wrapper(task));
            } else if snapshot.can_admit_read() {
                let Some(task) = self.read_queue.try_pop_front() else {
                    backoff.pause();
                    continue;
                };
                let _ = self
                    .state
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                        Some(cur - ONE_READ_PENDING + ONE_READER_ACTIVE)
                    });
                self.executor_for(from_completion)
                    .execute(self.read_wrapper(task));
                // Keep draining readers until a write shows up.
            } else {
                self.state.fetch_and(!COMBINER_BIT, Ordering::AcqRel);
                // Work may have arrived while we still held the bit; if so
                // and nobody else took over, resume.
                let after = RwState::decode(self.state.load(Ordering::Acquire));
                if after.can_admit() && self.try_claim_combiner() {
                    continue;
                }
                return;
            }
        }
    }

    fn executor_for(&self, from_completion: bool) -> &ExecutorHandle {
        if from_completion {
            &self.cont
        } else {
            &self.base
        }
    }

    fn write_wrapper(self: &Arc<Self>, task: Task) -> Task {
        let inner = Arc::clone(self);
        Task::new(move || {
            task.run_with(inner.on_error.as_ref());
            inner.state.fetch_and(!WRITER_ACTIVE_BIT, Ordering::AcqRel);
            inner.admit(true);
        })
    }

    fn read_wrapper(self: &Arc<Self>, task: Task) -> Task {
        let inner = Arc::clone(self);
        Task::new(move || {
            task.run_with(inner.on_error.as_ref());
            inner.state.fetch_sub(ONE_READER_ACTIVE, Ordering::AcqRel);
            inner.admit(true);
        })
    }
}

fn fmt_rw(inner: &RwInner, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = RwState::decode(inner.state.load(Ordering::Relaxed));
    f.debug_struct(name)
        .field("reads_pending", &state.reads_pending)
        .field("writes_pending", &state.writes_pending)
        .field("readers_active", &state.readers_active)
        .field("writer_active", &state.writer_active)
        .finish()
}

impl fmt::Debug for RwSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_rw(&self.inner, "RwSerializer", f)
    }
}

impl fmt::Debug for RwReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_rw(&self.inner, "RwReader", f)
    }
}

impl fmt::Debug for RwWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_rw(&self.inner, "RwWriter", f)
    }
}

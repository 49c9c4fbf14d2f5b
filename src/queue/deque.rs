//! Per-worker double-ended queue.
//!
//! Two layers. The fast layer is a fixed circular buffer whose occupied
//! range lives in a single packed atomic, so push/pop reservations are one
//! CAS. When the fast layer is full, elements overflow into a mutex-guarded
//! `VecDeque` that can grow without bound. FIFO order holds per end inside
//! the fast layer; order is NOT preserved across the fast/slow transition,
//! which the task system tolerates.

use crate::util::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

// Slot life cycle: Free -> Constructing -> Valid -> Destructing -> Free.
// The transitions are CAS-guarded; the Valid/Free stores are the release
// edges that publish (resp. retire) the value itself.
const FREE: u8 = 0;
const CONSTRUCTING: u8 = 1;
const VALID: u8 = 2;
const DESTRUCTING: u8 = 3;

const MIN_CAPACITY: usize = 8;

/// The `(start, end)` index pair of the fast layer, packed into one u32 so
/// both ends move under a single CAS. Indices wrap freely in u16 space; the
/// occupancy is always computed with wrapping u16 arithmetic, never signed.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Range {
    start: u16,
    end: u16,
}

impl Range {
    fn unpack(word: u32) -> Self {
        Self {
            start: word as u16,
            end: (word >> 16) as u16,
        }
    }

    fn pack(self) -> u32 {
        (self.start as u32) | ((self.end as u32) << 16)
    }

    fn len(self) -> u16 {
        self.end.wrapping_sub(self.start)
    }
}

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// The slot state machine hands each value to exactly one consumer.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// Concurrent double-ended queue with a lock-free bounded fast path and an
/// unbounded mutex-guarded overflow path.
///
/// Any thread may push or pop at either end. The owning worker pushes
/// spawned tasks at the front and pops there; thieves pop at the back.
pub struct ConcurrentDeque<T> {
    capacity: u16,
    range: CachePadded<AtomicU32>,
    slots: Box<[Slot<T>]>,
    slow: Mutex<VecDeque<T>>,
    slow_len: CachePadded<AtomicUsize>,
    overflow_hits: AtomicU64,
}

unsafe impl<T: Send> Send for ConcurrentDeque<T> {}
unsafe impl<T: Send> Sync for ConcurrentDeque<T> {}

impl<T> ConcurrentDeque<T> {
    /// Create a deque whose fast layer holds `capacity` slots. The capacity
    /// is clamped so the occupancy always fits a u16; three slots are kept
    /// as a guard band so a full buffer can never alias an empty one under
    /// index wrap.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, u16::MAX as usize) as u16;
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(FREE),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            capacity,
            range: CachePadded::new(AtomicU32::new(0)),
            slots,
            slow: Mutex::new(VecDeque::new()),
            slow_len: CachePadded::new(AtomicUsize::new(0)),
            overflow_hits: AtomicU64::new(0),
        }
    }

    /// Slots in the fast layer.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Lock-free emptiness probe. May race with in-flight operations; the
    /// caller must treat the answer as a hint.
    pub fn is_empty(&self) -> bool {
        let range = Range::unpack(self.range.load(Ordering::Acquire));
        range.start == range.end && self.slow_len.load(Ordering::Acquire) == 0
    }

    /// Number of pushes that missed the fast layer and took the lock.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_hits.load(Ordering::Relaxed)
    }

    /// Push at the back, falling back to the overflow layer when the fast
    /// layer is full. This is the default producer operation.
    pub fn push_back(&self, value: T) {
        if let Err(value) = self.try_push_back(value) {
            self.overflow_hits.fetch_add(1, Ordering::Relaxed);
            let mut slow = self.slow.lock();
            self.slow_len.fetch_add(1, Ordering::Release);
            slow.push_back(value);
        }
    }

    /// Push at the front, falling back to the overflow layer when the fast
    /// layer is full.
    pub fn push_front(&self, value: T) {
        if let Err(value) = self.try_push_front(value) {
            self.overflow_hits.fetch_add(1, Ordering::Relaxed);
            let mut slow = self.slow.lock();
            self.slow_len.fetch_add(1, Ordering::Release);
            slow.push_front(value);
        }
    }

    /// Fast-layer-only push at the back; hands the value back on a full
    /// buffer.
    pub fn try_push_back(&self, value: T) -> Result<(), T> {
        match self.reserve_back() {
            Some(pos) => {
                self.publish(pos, value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Fast-layer-only push at the front; hands the value back on a full
    /// buffer.
    pub fn try_push_front(&self, value: T) -> Result<(), T> {
        match self.reserve_front() {
            Some(pos) => {
                self.publish(pos, value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Pop at the front. Checks the fast layer first, then the overflow
    /// layer. `None` only when both are empty.
    pub fn try_pop_front(&self) -> Option<T> {
        if let Some(pos) = self.consume_front() {
            return Some(self.take(pos));
        }
        if self.slow_len.load(Ordering::Acquire) > 0 {
            let mut slow = self.slow.lock();
            let value = slow.pop_front()?;
            self.slow_len.fetch_sub(1, Ordering::Release);
            return Some(value);
        }
        None
    }

    /// Pop at the back; the stealing operation.
    pub fn try_pop_back(&self) -> Option<T> {
        if let Some(pos) = self.consume_back() {
            return Some(self.take(pos));
        }
        if self.slow_len.load(Ordering::Acquire) > 0 {
            let mut slow = self.slow.lock();
            let value = slow.pop_back()?;
            self.slow_len.fetch_sub(1, Ordering::Release);
            return Some(value);
        }
        None
    }

    /// Single-owner reset, for shutdown paths that hold exclusive access.
    /// Drops any still-queued values. A no-op on an empty deque.
    pub fn unsafe_clear(&mut self) {
        *self.range.get_mut() = 0;
        for slot in self.slots.iter_mut() {
            if *slot.state.get_mut() == VALID {
                // Exclusive access: the published value is ours to drop.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
            *slot.state.get_mut() = FREE;
        }
        self.slow.get_mut().clear();
        *self.slow_len.get_mut() = 0;
    }

    /// Reserve one slot at the back. `None` when occupancy would exceed
    /// `capacity - 3`; the guard band keeps a wrapped full buffer from
    /// looking empty.
    fn reserve_back(&self) -> Option<u16> {
        let max_dist = self.capacity - 3;
        let mut cur = self.range.load(Ordering::Relaxed);
        loop {
            let range = Range::unpack(cur);
            if range.len() > max_dist {
                return None;
            }
            let next = Range {
                start: range.start,
                end: range.end.wrapping_add(1),
            };
            match self.range.compare_exchange_weak(
                cur,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(range.end),
                Err(observed) => cur = observed,
            }
        }
    }

    fn reserve_front(&self) -> Option<u16> {
        let max_dist = self.capacity - 3;
        let mut cur = self.range.load(Ordering::Relaxed);
        loop {
            let range = Range::unpack(cur);
            if range.len() > max_dist {
                return None;
            }
            let next = Range {
                start: range.start.wrapping_sub(1),
                end: range.end,
            };
            match self.range.compare_exchange_weak(
                cur,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(next.start),
                Err(observed) => cur = observed,
            }
        }
    }

    fn consume_front(&self) -> Option<u16> {
        let mut cur = self.range.load(Ordering::Relaxed);
        loop {
            let range = Range::unpack(cur);
            if range.start == range.end {
                return None;
            }
            let next = Range {
                start: range.start.wrapping_add(1),
                end: range.end,
            };
            match self.range.compare_exchange_weak(
                cur,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(range.start),
                Err(observed) => cur = observed,
            }
        }
    }

    fn consume_back(&self) -> Option<u16> {
        let mut cur = self.range.load(Ordering::Relaxed);
        loop {
            let range = Range::unpack(cur);
            if range.start == range.end {
                return None;
            }
            let next = Range {
                start: range.start,
                end: range.end.wrapping_sub(1),
            };
            match self.range.compare_exchange_weak(
                cur,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(next.end),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Write a value into a reserved slot. The previous consumer of the slot
    /// may still be moving its value out, so wait for `Free` first.
    fn publish(&self, pos: u16, value: T) {
        let slot = &self.slots[(pos % self.capacity) as usize];
        let mut backoff = Backoff::new();
        while slot
            .state
            .compare_exchange(FREE, CONSTRUCTING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            backoff.pause();
        }
        // Sole writer: the CONSTRUCTING state excludes everyone else.
        unsafe { (*slot.value.get()).write(value) };
        slot.state.store(VALID, Ordering::Release);
    }

    /// Move the value out of a consumed slot. The producer may still be
    /// writing it, so wait for `Valid` first.
    fn take(&self, pos: u16) -> T {
        let slot = &self.slots[(pos % self.capacity) as usize];
        let mut backoff = Backoff::new();
        while slot
            .state
            .compare_exchange(VALID, DESTRUCTING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            backoff.pause();
        }
        // Sole reader, and the slot was fully written before turning Valid.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.state.store(FREE, Ordering::Release);
        value
    }
}

impl<T> Drop for ConcurrentDeque<T> {
    fn drop(&mut self) {
        self.unsafe_clear();
    }
}

impl<T> fmt::Debug for ConcurrentDeque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = Range::unpack(self.range.load(Ordering::Relaxed));
        f.debug_struct("ConcurrentDeque")
            .field("capacity", &self.capacity)
            .field("fast_len", &range.len())
            .field("slow_len", &self.slow_len.load(Ordering::Relaxed))
            .finish()
    }
}

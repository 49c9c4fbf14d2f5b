use rand::Rng;
use std::hint::spin_loop;
use std::thread;
use std::time::Duration;

/// Adaptive back-off for short contention windows.
///
/// Escalates from busy spins to OS yields to jittered micro-sleeps capped at
/// one millisecond. `pause` is a hint only; callers must re-check their
/// condition after every call, and a condition that can never become true
/// must be detected by the caller.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 12;
    const MAX_SLEEP_US: u64 = 1_000;

    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Rewind after the caller made progress.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Wait a little, longer on each consecutive call.
    pub fn pause(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            let exp = (self.step - Self::YIELD_LIMIT).min(10);
            let cap = (1u64 << exp).min(Self::MAX_SLEEP_US);
            let us = rand::thread_rng().gen_range(cap / 2 + 1..=cap);
            thread::sleep(Duration::from_micros(us));
        }
        self.step = self.step.saturating_add(1);
    }

    /// True once the back-off has escalated past the yield stage.
    pub fn is_sleeping(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

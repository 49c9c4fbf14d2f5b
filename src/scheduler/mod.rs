//! Work-stealing scheduling.
//!
//! The task system owns one deque per worker thread. Tasks enqueued from
//! outside land round-robin at the backs; tasks spawned from within a worker
//! land at the front of that worker's own deque. Idle workers steal from the
//! backs of the others, then park.

pub mod spawn;
pub mod task_system;
pub(crate) mod worker;

pub use spawn::{spawn, spawn_and_wait, spawn_continuation, spawn_many, wait};
pub use task_system::{SystemStats, TaskSystem, WorkerGuard};

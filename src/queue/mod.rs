//! Concurrent task queues.

pub mod deque;

pub use deque::ConcurrentDeque;

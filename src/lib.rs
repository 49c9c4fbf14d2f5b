//! WEFT - Work-stealing Executors for Fine-grained Tasks
//!
//! A task runtime: independent units of work executed on a pool of worker
//! threads, plus a family of executors that impose ordering constraints on
//! top of it.
//!
//! # Quick Start
//!
//! ```no_run
//! use weft::prelude::*;
//!
//! // Initialize the global runtime
//! weft::init().unwrap();
//!
//! // Submit unconstrained work
//! let ge = global_executor();
//! ge.execute_fn(|| println!("somewhere, soon"));
//!
//! // Or at most one at a time, in order
//! let chat_log = Serializer::new(global_executor());
//! chat_log.execute_fn(|| println!("first"));
//! chat_log.execute_fn(|| println!("second"));
//!
//! weft::shutdown();
//! ```
//!
//! # Features
//!
//! - **Work Stealing**: per-worker deques with randomized stealing
//! - **Structured Waiting**: task groups count outstanding work, and
//!   `busy_wait_on` lets the waiting thread execute tasks itself
//! - **Serializers**: mutual exclusion, bounded parallelism and
//!   reader/writer constraints composed over any executor
//! - **Low Overhead**: submission is one CAS on the fast path; workers park
//!   only after the whole system looks empty

// Lint configuration
#![warn(missing_debug_implementations)]
#![allow(dead_code)] // During development

pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod util;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use runtime::{init, init_with_config, shutdown};
pub use scheduler::{spawn, spawn_and_wait, spawn_many, wait, TaskSystem};
pub use task::{Task, TaskGroup};

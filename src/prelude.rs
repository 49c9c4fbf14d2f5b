//! Convenient re-exports for common weft types.
//!
//! ```
//! use weft::prelude::*;
//! ```

pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{
    global_executor, Executor, ExecutorHandle, GlobalExecutor, NSerializer, RwReader,
    RwSerializer, RwWriter, Serializer, SpawnContinuationExecutor, SpawnExecutor,
};
pub use crate::scheduler::{
    spawn, spawn_and_wait, spawn_continuation, spawn_many, wait, SystemStats, TaskSystem,
    WorkerGuard,
};
pub use crate::task::{ErrorHandler, Task, TaskError, TaskGroup};

#[doc(inline)]
pub use crate::{init, init_with_config, shutdown};

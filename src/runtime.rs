//! The process-global task system.
//!
//! Created explicitly through [`init`] or lazily by the first use of the
//! global executor. [`shutdown`] drains the queues and joins the workers;
//! nothing happens implicitly at process exit.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::TaskSystem;
use parking_lot::RwLock;
use std::sync::Arc;

static GLOBAL: RwLock<Option<Arc<TaskSystem>>> = RwLock::new(None);

/// Initialise the global task system with default configuration.
pub fn init() -> Result<()> {
    init_with_config(Config::default())
}

/// Initialise the global task system. Fails if one already exists.
pub fn init_with_config(config: Config) -> Result<()> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    *global = Some(Arc::new(TaskSystem::new(config)?));
    Ok(())
}

/// The global instance, created on first use.
pub(crate) fn global() -> Arc<TaskSystem> {
    if let Some(system) = GLOBAL.read().as_ref() {
        return system.clone();
    }
    let mut global = GLOBAL.write();
    if let Some(system) = global.as_ref() {
        return system.clone();
    }
    let system = Arc::new(
        TaskSystem::new(Config::default())
            .expect("failed to start the default task system"),
    );
    *global = Some(system.clone());
    system
}

/// Tear down the global task system: stop and join the workers, drop
/// whatever never ran. In-flight task bodies finish first. A later [`init`]
/// or global submission starts a fresh instance.
pub fn shutdown() {
    let system = GLOBAL.write().take();
    if let Some(system) = system {
        system.shutdown();
    }
}

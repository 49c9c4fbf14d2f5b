use crate::error::{Error, Result};

/// Runtime construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count; defaults to the hardware parallelism.
    pub worker_threads: Option<usize>,
    /// Fast-layer slots per worker deque.
    pub deque_capacity: usize,
    /// Stack size per worker thread.
    pub stack_size: Option<usize>,
    /// Worker threads are named `"<prefix>-<index>"`.
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: None,
            deque_capacity: 1024,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "weft-worker".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.worker_threads {
            if n == 0 {
                return Err(Error::config("worker_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("worker_threads too large (max 1024)"));
            }
        }

        // The deque keeps its occupancy in a u16 with a three-slot guard
        // band, so the capacity must leave room for both.
        if self.deque_capacity < 8 {
            return Err(Error::config("deque_capacity must be at least 8"));
        }
        if self.deque_capacity > u16::MAX as usize {
            return Err(Error::config("deque_capacity must fit a u16"));
        }

        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = Some(n);
        self
    }

    pub fn deque_capacity(mut self, capacity: usize) -> Self {
        self.config.deque_capacity = capacity;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Config::builder().worker_threads(0).build().is_err());
    }

    #[test]
    fn test_deque_capacity_bounds() {
        assert!(Config::builder().deque_capacity(4).build().is_err());
        assert!(Config::builder().deque_capacity(1 << 17).build().is_err());
        assert!(Config::builder().deque_capacity(1024).build().is_ok());
    }
}

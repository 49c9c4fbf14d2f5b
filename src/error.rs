//! Error types for runtime construction.
//!
//! Task submission itself is infallible; only building a runtime and
//! initialising the global instance can fail.

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The global runtime was initialised twice
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// Worker thread creation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}

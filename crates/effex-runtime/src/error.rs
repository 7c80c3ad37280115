//! Runtime error types

use effex_core::LayerError;
use thiserror::Error;

/// Maximum worker threads a runtime may start
pub const MAX_WORKERS: usize = 256;

/// Invalid [`RuntimeConfig`](crate::RuntimeConfig)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("num_workers must be at least 1")]
    NoWorkers,

    #[error("num_workers {0} exceeds the maximum of {MAX_WORKERS}")]
    TooManyWorkers(usize),

    #[error("park_timeout must be non-zero")]
    ZeroParkTimeout,

    #[error("timer_poll_interval must be non-zero")]
    ZeroTimerPoll,

    #[error("thread_name_prefix must not be empty")]
    EmptyThreadName,
}

/// Errors reported before a program starts, or by the runtime itself
#[derive(Debug, Error)]
pub enum RunError {
    /// The program needs services nobody provides
    #[error("missing services: {}", .services.join(", "))]
    MissingServices {
        /// Tag names, in tag id order
        services: Vec<&'static str>,
    },

    /// A statically visible layer graph cannot be planned
    #[error("invalid layer graph: {0}")]
    Layer(#[from] LayerError),

    /// The runtime configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A worker or timer thread could not be started
    #[error("failed to spawn {thread}: {source}")]
    WorkerSpawn {
        /// Thread name
        thread: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime has been shut down
    #[error("runtime is shut down")]
    Shutdown,
}

/// Result type for runtime operations
pub type RunResult<T> = Result<T, RunError>;

//! # effex-runtime
//!
//! Fiber interpreter for effex effects.
//!
//! This crate provides:
//! - Worker thread management (a fixed pool of OS threads)
//! - A shared ready queue with condvar parking for idle workers
//! - A timer thread backing `sleep`, `timeout` and retry delays
//! - Fibers with supervised children, cooperative interruption and
//!   finalizers
//! - The trampolined interpreter, race/all coordinators and the per-run
//!   layer memo
//!
//! ```ignore
//! use effex_core::Effect;
//! use effex_runtime::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default().num_workers(2))?;
//! let exit = rt.run_blocking(Effect::<u32, String>::succeed(41).map(|n| n + 1))?;
//! assert_eq!(exit, Ok(42));
//! ```

pub mod config;
pub mod error;
pub mod ready_queue;
pub mod timer;
pub mod tls;
pub mod worker;

mod coordinator;
mod fiber;
mod interpreter;
mod memo;
mod runtime;

// Re-exports
pub use config::RuntimeConfig;
pub use error::{ConfigError, RunError, RunResult, MAX_WORKERS};
pub use runtime::{RunHandle, Runtime};

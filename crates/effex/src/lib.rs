//! # effex - Lazy Typed Effects
//!
//! Describe work as values, run it on a fiber runtime.
//!
//! ## Features
//!
//! - **Lazy**: building an `Effect` never runs anything; effects are re-runnable
//! - **Typed failures**: `Fail(E)` is recovered by `catch_*`, while defects and
//!   interruption travel past typed handlers
//! - **Structured concurrency**: `race`, `all` with a concurrency bound,
//!   `timeout`, `fork`; children never outlive their parent
//! - **Cooperative interruption**: finalizers always run, acquisition is
//!   uninterruptible
//! - **Dependency injection**: `Tag` + `Layer`, checked before the program starts,
//!   each layer built once per run
//! - **Retry schedules**: `recurs`, `fixed`, `fibonacci`, `exponential` and their
//!   combinations
//!
//! ## Quick Start
//!
//! ```ignore
//! use effex::{Effect, Schedule};
//! use std::time::Duration;
//!
//! fn main() {
//!     effex::init_logging();
//!
//!     let program: Effect<u32, String> = Effect::sync(|| 20)
//!         .map(|n| n + 1)
//!         .flat_map(|n| Effect::succeed(n * 2))
//!         .retry(Schedule::recurs(3).intersect(Schedule::fixed(Duration::from_millis(10))))
//!         .timeout(Duration::from_secs(1));
//!
//!     match effex::run_blocking(program) {
//!         Ok(Ok(n)) => println!("got {}", n),
//!         Ok(Err(cause)) => println!("program {}", cause),
//!         Err(e) => println!("could not start: {}", e),
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │     Effect::sync/map/flat_map, Layer, Schedule, Ref         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  Runtime::run
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Interpreter                            │
//! │   fibers, frame stack, race/all coordinators, layer memo    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │   Timer   │
//!    │  Thread   │      │  Thread   │      │   Thread  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                 Ready Queue (SegQueue)                  │
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::sync::OnceLock;

use parking_lot::Mutex;

// Re-export core types
pub use effex_core::{
    AllMode,
    AllOptions,
    Canceler,
    CatchTags,
    Cause,
    Concurrency,
    Context,
    Decision,
    Defect,
    DefectKind,
    Effect,
    Exit,
    Fiber,
    FiberId,
    FiberStatus,
    Layer,
    LayerError,
    Level,
    Ref,
    Requirements,
    Resume,
    Schedule,
    Tag,
    Tagged,
};

// Generator-style sequencing macro
pub use effex_core::effect;

// Logging and env utilities
pub use effex_core::log::{init as init_logging, init_test as init_test_logging};
pub use effex_core::{env_get, env_get_bool, env_get_duration_ms, env_get_opt, env_get_str};

// Re-export runtime types
pub use effex_runtime::{ConfigError, RunError, RunHandle, RunResult, Runtime, RuntimeConfig, MAX_WORKERS};

static DEFAULT_RUNTIME: OnceLock<Runtime> = OnceLock::new();
static DEFAULT_INIT: Mutex<()> = parking_lot::const_mutex(());

/// The process-wide runtime, started on first use from `EFFEX_*` variables
///
/// It is never shut down; its workers live until the process exits.
pub fn default_runtime() -> RunResult<&'static Runtime> {
    if let Some(rt) = DEFAULT_RUNTIME.get() {
        return Ok(rt);
    }
    let _guard = DEFAULT_INIT.lock();
    if let Some(rt) = DEFAULT_RUNTIME.get() {
        return Ok(rt);
    }
    let rt = Runtime::from_env()?;
    Ok(DEFAULT_RUNTIME.get_or_init(|| rt))
}

/// Start `effect` on the default runtime
pub fn run<A, E>(effect: Effect<A, E>) -> RunResult<RunHandle<A, E>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    default_runtime()?.run(effect)
}

/// Run `effect` on the default runtime and wait for its exit
///
/// The outer `Result` reports programs rejected before they started; the
/// inner [`Exit`] is the program's own outcome.
pub fn run_blocking<A, E>(effect: Effect<A, E>) -> RunResult<Exit<A, E>>
where
    A: Send + 'static,
    E: Send + 'static,
{
    default_runtime()?.run_blocking(effect)
}

/// Common imports
pub mod prelude {
    pub use crate::{
        effect, AllOptions, Cause, Concurrency, Context, Defect, Effect, Exit, Fiber, Layer, Ref, Schedule, Tag,
        Tagged,
    };
}

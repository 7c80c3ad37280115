//! # effex-core
//!
//! The effect algebra: lazy, typed descriptions of work, with their services,
//! failures and schedules. Nothing in this crate runs an effect; the
//! interpreter lives in `effex-runtime`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Effect<A, E>   typed builder API (map, catch, provide, all) │
//! │      │                                                       │
//! │      ▼                                                       │
//! │  Node tree      erased values (Box<dyn Any + Send>)          │
//! │      │          + Requirements (tags still needed)           │
//! └──────┼───────────────────────────────────────────────────────┘
//!        ▼
//!   effex-runtime: fibers, workers, timer, layer memo
//! ```
//!
//! ## Modules
//!
//! - `id` - fiber, tag and layer identifiers
//! - `state` - fiber status
//! - `cause` - `Cause`, `Defect` and `Exit`
//! - `context` - service tags, the context map and requirement sets
//! - `effect` - the `Effect` type and its combinators
//! - `layer` - service layers and their build plan
//! - `schedule` - retry/repeat policies
//! - `refs` - shared mutable cells
//! - `traits` - interface the runtime implements for fiber handles
//! - `log` - tracing setup and fiber log spans
//! - `error` - layer graph errors
//! - `env` - environment variable helpers

pub mod cause;
pub mod context;
pub mod effect;
pub mod env;
pub mod error;
pub mod id;
pub mod layer;
pub mod log;
mod macros;
pub mod refs;
pub mod schedule;
pub mod state;
pub mod traits;

pub use cause::{Cause, Defect, DefectKind, Exit, Tagged};
pub use context::{Context, Requirements, Tag};
pub use effect::{AllMode, AllOptions, Canceler, CatchTags, Concurrency, Effect, Fiber, Resume};
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt, env_get_str};
pub use error::{LayerError, LayerResult};
pub use id::{FiberId, LayerId, TagId};
pub use layer::Layer;
pub use refs::Ref;
pub use schedule::{Decision, Schedule};
pub use state::FiberStatus;
pub use traits::RawFiber;

pub use tracing::Level;

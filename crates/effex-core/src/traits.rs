//! Runtime interface traits
//!
//! The algebra in this crate is runtime-agnostic. Where an effect needs to
//! talk to a live fiber (joining or interrupting a forked child) it goes
//! through [`RawFiber`], which the interpreter implements.

use crate::effect::raw::RawExit;
use crate::id::FiberId;
use crate::state::FiberStatus;

/// Handle to a running fiber, as seen from the effect algebra
pub trait RawFiber: Send + Sync {
    /// Fiber id
    fn id(&self) -> FiberId;

    /// Current status
    fn status(&self) -> FiberStatus;

    /// Run `callback` once the fiber is terminal (immediately if it already is)
    fn on_terminal(&self, callback: Box<dyn FnOnce() + Send>);

    /// Take the terminal exit; `None` if not terminal yet or already taken
    fn take_exit(&self) -> Option<RawExit>;

    /// Request interruption (children first); returns without waiting
    fn interrupt(&self);
}

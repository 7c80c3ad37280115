//! Timer entry and handle types

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Work run on the timer thread when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Globally unique timer handle for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl TimerHandle {
    /// Generate a new unique timer handle
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw handle value
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer entry: a deadline and what to do when it passes
pub struct TimerEntry {
    /// Unique handle for cancellation
    pub handle: TimerHandle,

    /// When this timer should fire
    pub deadline: Instant,

    /// Run once on expiry
    pub callback: TimerCallback,
}

impl TimerEntry {
    /// Timer firing at an absolute deadline
    pub fn at(deadline: Instant, callback: TimerCallback) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline,
            callback,
        }
    }

    /// Timer firing after `delay`
    pub fn after(delay: Duration, callback: TimerCallback) -> Self {
        Self::at(Instant::now() + delay, callback)
    }

    /// Check if this timer has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time remaining until deadline (zero if expired)
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("handle", &self.handle)
            .field("deadline", &self.deadline)
            .finish()
    }
}

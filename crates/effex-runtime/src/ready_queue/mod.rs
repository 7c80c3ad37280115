//! Ready queue abstraction for fiber scheduling
//!
//! Workers pop runnable fibers and park when there are none. A fiber is in
//! the queue at most once at a time: it is pushed on spawn, on yield and
//! when a suspended fiber is resumed.
//!
//! # Implementations
//! - `GlobalQueue` - one lock-free FIFO shared by all workers, condvar parking

mod global;

pub use global::GlobalQueue;

use std::time::Duration;

/// Trait for ready queue implementations
///
/// All implementations must be thread-safe (Send + Sync).
pub trait ReadyQueue<T>: Send + Sync {
    /// Make an item ready to run
    fn push(&self, item: T);

    /// Next ready item, if any
    fn pop(&self) -> Option<T>;

    /// Park the calling worker until work arrives or `timeout` elapses
    fn park(&self, timeout: Duration);

    /// Wake one parked worker
    fn wake_one(&self);

    /// Wake all parked workers (shutdown)
    fn wake_all(&self);

    /// Approximate ready count (for diagnostics)
    fn len(&self) -> usize;

    /// Check if empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

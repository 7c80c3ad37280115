//! Timer subsystem
//!
//! Sleeping fibers do not hold a worker: `Sleep` registers a callback with
//! the timer and parks the fiber. One timer thread fires due callbacks,
//! which resume the fiber onto the ready queue.
//!
//! # Architecture
//!
//! ```text
//!     interpreter ──schedule(delay, cb)──► TimerRegistry
//!                                              │  insert + wake
//!                                              ▼
//!                                   ┌─────────────────────┐
//!                                   │  dyn TimerBackend   │
//!                                   └─────────────────────┘
//!                                              │
//!                                              ▼
//!                                        HeapTimerBackend
//!                                              │
//!     timer thread ──poll_expired()──► callbacks ──► fiber resume ──► ReadyQueue
//! ```

mod entry;
mod heap;
mod worker;

pub use entry::{TimerCallback, TimerEntry, TimerHandle};
pub use heap::HeapTimerBackend;
pub use worker::{spawn_timer_thread, TimerStats, TimerThreadHandle};

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Timer storage
///
/// All implementations must be thread-safe: workers insert and cancel
/// while the timer thread polls.
pub trait TimerBackend: Send + Sync {
    /// Insert an entry, returns its handle
    fn insert(&self, entry: TimerEntry) -> TimerHandle;

    /// Cancel a timer (best-effort, may already have fired)
    /// Returns true if the timer was still pending
    fn cancel(&self, handle: TimerHandle) -> bool;

    /// Remove and return the callbacks of all timers due at `now`
    fn poll_expired(&self, now: Instant) -> Vec<TimerCallback>;

    /// Earliest pending deadline
    fn next_deadline(&self) -> Option<Instant>;

    /// Number of pending timers
    fn len(&self) -> usize;

    /// Counters snapshot
    fn stats(&self) -> BackendStats;

    /// Check if no timers are pending
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend name for debugging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Lifetime counters of a timer backend
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Pending timers
    pub active: usize,
    /// Cancelled keys not yet dropped from the backend's index
    pub stale_keys: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

/// Wake-up signal between inserters and the timer thread
///
/// `epoch` is bumped on every insert so the thread never sleeps past a
/// deadline inserted while it was computing its timeout.
#[derive(Default)]
pub(crate) struct TimerSignal {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl TimerSignal {
    fn bump(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_one();
    }

    fn current(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Sleep up to `timeout` unless the epoch moved past `seen`
    fn wait(&self, seen: u64, timeout: Duration) {
        let mut epoch = self.epoch.lock();
        if *epoch == seen {
            let _ = self.cond.wait_for(&mut epoch, timeout);
        }
    }
}

/// High-level timer API used by the interpreter
#[derive(Clone)]
pub struct TimerRegistry {
    backend: Arc<dyn TimerBackend>,
    signal: Arc<TimerSignal>,
}

impl TimerRegistry {
    /// Create a registry over `backend`
    pub fn new(backend: Arc<dyn TimerBackend>) -> Self {
        Self {
            backend,
            signal: Arc::new(TimerSignal::default()),
        }
    }

    /// Underlying backend
    pub fn backend(&self) -> Arc<dyn TimerBackend> {
        Arc::clone(&self.backend)
    }

    /// Run `callback` on the timer thread after `delay`
    pub fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let deadline = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        let handle = self.backend.insert(TimerEntry::at(deadline, callback));
        self.signal.bump();
        handle
    }

    /// Cancel a pending timer
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.backend.cancel(handle)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Check if no timers are pending
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    pub(crate) fn signal(&self) -> Arc<TimerSignal> {
        Arc::clone(&self.signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_registry_schedule_and_cancel() {
        let registry = TimerRegistry::new(Arc::new(HeapTimerBackend::new()));
        assert!(registry.is_empty());

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = registry.schedule(Duration::from_secs(10), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(registry.len(), 1);

        assert!(registry.cancel(handle));
        assert!(!registry.cancel(handle));
        assert!(registry.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_signal_epoch() {
        let signal = TimerSignal::default();
        let seen = signal.current();
        signal.bump();
        // epoch moved: returns without sleeping
        let start = Instant::now();
        signal.wait(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

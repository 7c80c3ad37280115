//! BinaryHeap-based timer backend
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy)
//! - Poll expired: O(k log n) where k = number of expired timers
//!
//! # Cancellation Strategy
//!
//! The heap only holds `(deadline, handle)`; callbacks live in a map keyed
//! by handle. Cancelling removes the callback right away, so whatever it
//! captured is released, and the stale heap key is skipped when it
//! reaches the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use parking_lot::Mutex;

use super::{BackendStats, TimerBackend, TimerCallback, TimerEntry, TimerHandle};

struct HeapInner {
    /// Min-heap by deadline, ties by handle
    heap: BinaryHeap<Reverse<(Instant, TimerHandle)>>,

    /// Callbacks of pending (not fired, not cancelled) timers
    callbacks: HashMap<TimerHandle, TimerCallback>,

    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl HeapInner {
    fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            callbacks: HashMap::with_capacity(capacity),
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    /// Drop cancelled keys sitting at the top
    fn skip_cancelled(&mut self) {
        while let Some(Reverse((_, handle))) = self.heap.peek() {
            if self.callbacks.contains_key(handle) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// BinaryHeap-based timer backend
///
/// Thread-safe via an internal mutex held only for the map and heap
/// updates; callbacks run outside of it.
pub struct HeapTimerBackend {
    inner: Mutex<HeapInner>,
}

impl HeapTimerBackend {
    /// Create a new heap-based timer backend
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create with specified initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HeapInner::new(capacity)),
        }
    }
}

impl Default for HeapTimerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        let mut inner = self.inner.lock();
        inner.heap.push(Reverse((entry.deadline, handle)));
        inner.callbacks.insert(handle, entry.callback);
        inner.total_inserted += 1;
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.callbacks.remove(&handle);
            if removed.is_some() {
                inner.total_cancelled += 1;
            }
            if inner.callbacks.is_empty() {
                inner.heap.clear();
            }
            removed
        };
        // dropped outside the lock
        removed.is_some()
    }

    fn poll_expired(&self, now: Instant) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, handle))) = inner.heap.peek().copied() {
            if deadline > now {
                break;
            }
            inner.heap.pop();
            if let Some(callback) = inner.callbacks.remove(&handle) {
                inner.total_fired += 1;
                expired.push(callback);
            }
        }

        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        inner.skip_cancelled();
        inner.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    fn stats(&self) -> BackendStats {
        let inner = self.inner.lock();
        BackendStats {
            active: inner.callbacks.len(),
            stale_keys: inner.heap.len().saturating_sub(inner.callbacks.len()),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }

    fn name(&self) -> &'static str {
        "binary_heap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder(log: &Arc<PlMutex<Vec<u32>>>, id: u32) -> TimerCallback {
        let log = Arc::clone(log);
        Box::new(move || log.lock().push(id))
    }

    #[test]
    fn test_insert_and_poll() {
        let backend = HeapTimerBackend::new();
        let log = Arc::new(PlMutex::new(Vec::new()));

        backend.insert(TimerEntry::after(Duration::ZERO, recorder(&log, 42)));
        assert_eq!(backend.len(), 1);

        let expired = backend.poll_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        for cb in expired {
            cb();
        }
        assert_eq!(*log.lock(), vec![42]);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_ordering() {
        let backend = HeapTimerBackend::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let now = Instant::now();

        backend.insert(TimerEntry::at(now + Duration::from_millis(30), recorder(&log, 3)));
        backend.insert(TimerEntry::at(now + Duration::from_millis(10), recorder(&log, 1)));
        backend.insert(TimerEntry::at(now + Duration::from_millis(20), recorder(&log, 2)));

        for cb in backend.poll_expired(now + Duration::from_millis(50)) {
            cb();
        }
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel() {
        let backend = HeapTimerBackend::new();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let keep = backend.insert(TimerEntry::after(Duration::from_secs(1), recorder(&log, 1)));
        let handle = backend.insert(TimerEntry::after(Duration::from_secs(1), recorder(&log, 2)));
        assert!(backend.cancel(handle));
        assert!(!backend.cancel(handle));
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.stats().stale_keys, 1);

        for cb in backend.poll_expired(Instant::now() + Duration::from_secs(2)) {
            cb();
        }
        assert_eq!(*log.lock(), vec![1]);
        assert!(!backend.cancel(keep));
    }

    #[test]
    fn test_cancel_releases_captures() {
        let backend = HeapTimerBackend::new();
        let payload = Arc::new(());
        let held = Arc::clone(&payload);
        let handle = backend.insert(TimerEntry::after(
            Duration::from_secs(60),
            Box::new(move || drop(held)),
        ));
        assert_eq!(Arc::strong_count(&payload), 2);
        backend.cancel(handle);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let backend = HeapTimerBackend::new();
        let now = Instant::now();
        assert!(backend.next_deadline().is_none());

        let early = backend.insert(TimerEntry::at(now + Duration::from_millis(10), Box::new(|| {})));
        backend.insert(TimerEntry::at(now + Duration::from_millis(100), Box::new(|| {})));
        backend.cancel(early);

        assert_eq!(backend.next_deadline(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_stats() {
        let backend = HeapTimerBackend::new();
        backend.insert(TimerEntry::after(Duration::ZERO, Box::new(|| {})));
        let handle2 = backend.insert(TimerEntry::after(Duration::from_secs(10), Box::new(|| {})));

        backend.poll_expired(Instant::now() + Duration::from_millis(1));
        backend.cancel(handle2);

        let stats = backend.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(backend.name(), "binary_heap");
    }
}

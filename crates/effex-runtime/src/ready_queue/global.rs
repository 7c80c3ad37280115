//! Global FIFO ready queue
//!
//! Design:
//! - `SegQueue` for push/pop without a lock
//! - Mutex + Condvar only for parking idle workers
//! - `parked` counter so pushes skip the lock when nobody sleeps

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use super::ReadyQueue;

/// Shared FIFO with worker parking
pub struct GlobalQueue<T> {
    queue: SegQueue<T>,
    lock: Mutex<()>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl<T> GlobalQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Number of parked workers
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }
}

impl<T> Default for GlobalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> ReadyQueue<T> for GlobalQueue<T> {
    fn push(&self, item: T) {
        self.queue.push(item);
        // A parker increments `parked` before checking the queue under the
        // lock, so taking the lock here cannot miss it.
        if self.parked.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_one();
        }
    }

    fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    fn park(&self, timeout: Duration) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = self.lock.lock();
            if self.queue.is_empty() {
                let _ = self.cond.wait_for(&mut guard, timeout);
            }
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_one(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let q = GlobalQueue::new();
        assert!(q.is_empty());

        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);

        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_park_times_out_when_empty() {
        let q: GlobalQueue<u32> = GlobalQueue::new();
        let start = Instant::now();
        q.park(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(q.parked_count(), 0);
    }

    #[test]
    fn test_push_wakes_parked_worker() {
        let q = Arc::new(GlobalQueue::new());
        let q2 = Arc::clone(&q);

        let worker = thread::spawn(move || {
            let start = Instant::now();
            loop {
                if let Some(v) = q2.pop() {
                    return (v, start.elapsed());
                }
                q2.park(Duration::from_secs(5));
            }
        });

        thread::sleep(Duration::from_millis(20));
        q.push(7u32);

        let (v, waited) = worker.join().unwrap();
        assert_eq!(v, 7);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_park_returns_immediately_with_work() {
        let q = GlobalQueue::new();
        q.push(1u8);
        let start = Instant::now();
        q.park(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

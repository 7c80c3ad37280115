//! Thread-local worker and fiber context

use std::cell::Cell;

use effex_core::FiberId;

thread_local! {
    /// Current worker index for this OS thread
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };

    /// Fiber currently being interpreted on this worker
    static CURRENT_FIBER: Cell<u64> = const { Cell::new(0) };
}

/// Set the current worker index
#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

/// Current worker index, `None` if not on a worker thread
#[inline]
pub fn try_current_worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

/// Check if the calling thread is a runtime worker
#[inline]
pub fn is_worker_thread() -> bool {
    try_current_worker_id().is_some()
}

/// Record the fiber this worker is running
#[inline]
pub fn set_current_fiber(id: FiberId) {
    CURRENT_FIBER.with(|cell| cell.set(id.as_u64()));
}

/// Clear the current fiber (worker going idle)
#[inline]
pub fn clear_current_fiber() {
    CURRENT_FIBER.with(|cell| cell.set(0));
}

/// Fiber currently running on this thread, `FiberId::NONE` if none
#[inline]
pub fn current_fiber_id() -> FiberId {
    FiberId::from_raw(CURRENT_FIBER.with(|cell| cell.get()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_roundtrip() {
        std::thread::spawn(|| {
            assert!(!is_worker_thread());
            set_worker_id(3);
            assert_eq!(try_current_worker_id(), Some(3));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_current_fiber() {
        std::thread::spawn(|| {
            assert!(current_fiber_id().is_none());
            let id = FiberId::next();
            set_current_fiber(id);
            assert_eq!(current_fiber_id(), id);
            clear_current_fiber();
            assert!(current_fiber_id().is_none());
        })
        .join()
        .unwrap();
    }
}

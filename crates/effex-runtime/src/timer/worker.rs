//! Timer thread
//!
//! Single thread that polls the backend and runs expired callbacks:
//! 1. Poll the backend for expired timers
//! 2. Run each callback (a fiber resume, which only pushes to the ready queue)
//! 3. Sleep until the next deadline, at most `poll_interval`, or until an
//!    insert bumps the signal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::{TimerBackend, TimerRegistry, TimerSignal};

/// Statistics from timer thread execution
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    /// Total poll iterations
    pub poll_count: u64,

    /// Total timers fired
    pub timers_fired: u64,

    /// Maximum timers fired in a single poll
    pub max_batch_size: usize,

    /// Timers cancelled before firing (backend lifetime)
    pub timers_cancelled: u64,

    /// Timers still pending when the thread stopped
    pub pending_at_stop: usize,
}

/// Handle to a running timer thread
pub struct TimerThreadHandle {
    handle: Option<JoinHandle<TimerStats>>,
    shutdown: Arc<AtomicBool>,
    signal: Arc<TimerSignal>,
}

impl TimerThreadHandle {
    /// Request shutdown and wait for the timer thread to exit
    pub fn shutdown(mut self) -> TimerStats {
        self.stop()
    }

    fn stop(&mut self) -> TimerStats {
        self.shutdown.store(true, Ordering::Release);
        self.signal.bump();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!("timer thread panicked");
                TimerStats::default()
            }
            None => TimerStats::default(),
        }
    }
}

impl Drop for TimerThreadHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

/// Spawn the timer thread for `registry`
pub fn spawn_timer_thread(
    registry: &TimerRegistry,
    thread_name: String,
    poll_interval: Duration,
) -> std::io::Result<TimerThreadHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = registry.signal();
    let backend = registry.backend();

    let thread_shutdown = Arc::clone(&shutdown);
    let thread_signal = Arc::clone(&signal);
    let handle = thread::Builder::new()
        .name(thread_name)
        .spawn(move || timer_loop(backend, thread_signal, thread_shutdown, poll_interval))?;

    Ok(TimerThreadHandle {
        handle: Some(handle),
        shutdown,
        signal,
    })
}

fn timer_loop(
    backend: Arc<dyn TimerBackend>,
    signal: Arc<TimerSignal>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) -> TimerStats {
    let mut stats = TimerStats::default();
    debug!(backend = backend.name(), "timer thread started");

    while !shutdown.load(Ordering::Acquire) {
        let seen = signal.current();
        let expired = backend.poll_expired(Instant::now());

        stats.poll_count += 1;
        stats.timers_fired += expired.len() as u64;
        stats.max_batch_size = stats.max_batch_size.max(expired.len());

        for callback in expired {
            callback();
        }

        let sleep = match backend.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(poll_interval),
            None => poll_interval,
        };
        if !sleep.is_zero() {
            signal.wait(seen, sleep);
        }
    }

    let backend_stats = backend.stats();
    stats.timers_cancelled = backend_stats.total_cancelled;
    stats.pending_at_stop = backend_stats.active;
    debug!(
        fired = stats.timers_fired,
        cancelled = stats.timers_cancelled,
        pending = stats.pending_at_stop,
        "timer thread stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::HeapTimerBackend;
    use parking_lot::Mutex;

    fn registry() -> TimerRegistry {
        TimerRegistry::new(Arc::new(HeapTimerBackend::new()))
    }

    #[test]
    fn test_timer_thread_fires() {
        let registry = registry();
        let woken = Arc::new(Mutex::new(Vec::new()));
        let w = Arc::clone(&woken);
        registry.schedule(Duration::from_millis(10), Box::new(move || w.lock().push(42)));

        let handle = spawn_timer_thread(&registry, "test-timer".into(), Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(80));
        let stats = handle.shutdown();

        assert!(stats.timers_fired >= 1);
        assert_eq!(*woken.lock(), vec![42]);
    }

    #[test]
    fn test_insert_wakes_long_sleep() {
        let registry = registry();
        // Long poll interval: only the signal can get the timer out early
        let handle = spawn_timer_thread(&registry, "test-timer".into(), Duration::from_secs(10)).unwrap();
        thread::sleep(Duration::from_millis(20));

        let fired_at = Arc::new(Mutex::new(None));
        let f = Arc::clone(&fired_at);
        let start = Instant::now();
        registry.schedule(Duration::from_millis(10), Box::new(move || *f.lock() = Some(Instant::now())));

        thread::sleep(Duration::from_millis(200));
        let fired = fired_at.lock().take();
        drop(handle);

        let fired = fired.expect("timer should have fired");
        assert!(fired.duration_since(start) < Duration::from_secs(5));
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let registry = registry();
        let woken = Arc::new(Mutex::new(false));
        let w = Arc::clone(&woken);
        let h = registry.schedule(Duration::from_millis(20), Box::new(move || *w.lock() = true));
        registry.cancel(h);

        registry.schedule(Duration::from_secs(60), Box::new(|| {}));

        let handle = spawn_timer_thread(&registry, "test-timer".into(), Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(60));
        let stats = handle.shutdown();
        assert!(!*woken.lock());
        assert_eq!(stats.timers_fired, 0);
        assert_eq!(stats.timers_cancelled, 1);
        assert_eq!(stats.pending_at_stop, 1);
    }
}

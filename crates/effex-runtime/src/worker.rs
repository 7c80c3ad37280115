//! Worker thread management
//!
//! Workers are OS threads that interpret fibers. Each loops: pop a ready
//! fiber, run one slice of it, repeat; park on the queue when idle. A
//! worker exits once shutdown is requested and the queue is empty.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace};

use crate::error::{RunError, RunResult};
use crate::fiber::Shared;
use crate::interpreter;
use crate::ready_queue::ReadyQueue;
use crate::tls;

/// Pool of worker threads
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `shared.config.num_workers` workers
    ///
    /// If a thread fails to spawn, the ones already started are stopped.
    pub(crate) fn start(shared: &Arc<Shared>) -> RunResult<Self> {
        let num_workers = shared.config.num_workers;
        let mut pool = Self {
            handles: Vec::with_capacity(num_workers),
        };

        for i in 0..num_workers {
            let name = shared.config.worker_thread_name(i);
            let worker_shared = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_main_loop(worker_shared, i));

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(source) => {
                    shared.request_shutdown();
                    pool.join();
                    return Err(RunError::WorkerSpawn { thread: name, source });
                }
            }
        }

        Ok(pool)
    }

    /// Number of workers
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for all workers to finish
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_main_loop(shared: Arc<Shared>, worker_id: usize) {
    tls::set_worker_id(worker_id);
    debug!(worker = worker_id, "worker started");

    loop {
        if let Some(fiber) = shared.queue.pop() {
            tls::set_current_fiber(fiber.id());
            trace!(worker = worker_id, fiber = %fiber.id(), "running slice");
            interpreter::run_slice(&fiber);
            tls::clear_current_fiber();
            continue;
        }

        if shared.is_shutdown() {
            break;
        }

        shared.queue.park(shared.config.park_timeout);
    }

    debug!(worker = worker_id, "worker stopped");
}

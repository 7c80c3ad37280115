//! Runtime: the execution entry point
//!
//! A [`Runtime`] owns the worker pool and the timer thread. Each call to
//! [`Runtime::run`] checks the program before anything executes, then starts
//! it as a root fiber with a fresh layer memo and returns a [`RunHandle`].
//!
//! ```text
//!   run(effect) ──► pre-flight ──► root fiber ──► ready queue ──► workers
//!                   (services,                                       │
//!                    layer graphs)      RunHandle::wait ◄── Exit ◄───┘
//! ```

use std::collections::HashSet;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use effex_core::effect::raw::{exit_from_raw, Node, NodeRef, RawExit};
use effex_core::{Cause, Defect, Effect, Exit, FiberId, FiberStatus, LayerError};

use crate::config::RuntimeConfig;
use crate::error::{RunError, RunResult};
use crate::fiber::{FiberInner, Shared};
use crate::timer::{spawn_timer_thread, TimerThreadHandle};
use crate::tls;
use crate::worker::WorkerPool;

/// Effect interpreter with its own worker pool and timer thread
pub struct Runtime {
    shared: Arc<Shared>,
    workers: Mutex<Option<WorkerPool>>,
    timer: Mutex<Option<TimerThreadHandle>>,
}

impl Runtime {
    /// Validate `config` and start the timer thread and workers
    pub fn new(config: RuntimeConfig) -> RunResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config));

        let timer_name = shared.config.timer_thread_name();
        let timer = spawn_timer_thread(&shared.timers, timer_name.clone(), shared.config.timer_poll_interval)
            .map_err(|source| RunError::WorkerSpawn {
                thread: timer_name,
                source,
            })?;
        let workers = WorkerPool::start(&shared)?;

        info!(workers = workers.num_workers(), "runtime started");
        Ok(Self {
            shared,
            workers: Mutex::new(Some(workers)),
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Runtime configured from `EFFEX_*` environment variables
    pub fn from_env() -> RunResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Start `effect` as a root fiber
    ///
    /// Fails without running anything if the program needs services no
    /// layer provides, or if a layer graph visible in the tree cannot be
    /// planned.
    pub fn run<A, E>(&self, effect: Effect<A, E>) -> RunResult<RunHandle<A, E>>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        if self.shared.is_shutdown() {
            return Err(RunError::Shutdown);
        }

        let missing = effect.requirements().names();
        if !missing.is_empty() {
            return Err(RunError::MissingServices { services: missing });
        }
        preflight(effect.node())?;

        let completion = Arc::new(Completion::new());
        let done = Arc::clone(&completion);
        let fiber = FiberInner::new_root(&self.shared, effect.into_node(), Box::new(move |exit| done.fill(exit)));
        self.shared.register_root(&fiber);
        debug!(fiber = %fiber.id(), "run started");
        fiber.start();

        Ok(RunHandle {
            fiber,
            completion,
            _types: PhantomData,
        })
    }

    /// Run `effect` and block the calling thread until it exits
    pub fn run_blocking<A, E>(&self, effect: Effect<A, E>) -> RunResult<Exit<A, E>>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        Ok(self.run(effect)?.wait())
    }

    /// Interrupt every live run, stop the workers and the timer thread
    ///
    /// Interrupted fibers already on the queue get to run their finalizers
    /// before the workers exit. Idempotent.
    pub fn shutdown(&self) {
        let roots = self.shared.live_roots();
        if !roots.is_empty() {
            debug!(roots = roots.len(), "interrupting live runs");
        }
        for root in roots {
            root.interrupt_fiber();
        }

        if !self.shared.request_shutdown() {
            return;
        }

        if let Some(mut workers) = self.workers.lock().take() {
            if tls::is_worker_thread() {
                warn!("runtime shut down from one of its own workers; not joining");
            } else {
                workers.join();
            }
        }
        if let Some(timer) = self.timer.lock().take() {
            let stats = timer.shutdown();
            debug!(
                timers_fired = stats.timers_fired,
                timers_cancelled = stats.timers_cancelled,
                timers_pending = stats.pending_at_stop,
                "timer thread joined"
            );
        }
        info!("runtime stopped");
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("shutdown", &self.shared.is_shutdown())
            .finish()
    }
}

/// Walk the statically visible tree (and the layer builds it provides)
/// looking for layer graphs that cannot be planned
fn preflight(root: &NodeRef) -> Result<(), LayerError> {
    let mut seen: HashSet<*const Node> = HashSet::new();
    let mut stack: Vec<&NodeRef> = vec![root];

    while let Some(node) = stack.pop() {
        if !seen.insert(Arc::as_ptr(node)) {
            continue;
        }
        if let Node::Provide(_, plan) = &**node {
            let layers = plan.layers().map_err(Clone::clone)?;
            stack.extend(layers.iter().map(|layer| layer.build()));
        }
        stack.extend(node.children());
    }
    Ok(())
}

// ============================================================================
// RunHandle
// ============================================================================

enum Slot {
    Pending,
    Ready(RawExit),
    Taken,
}

struct Completion {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            cond: Condvar::new(),
        }
    }

    fn fill(&self, exit: RawExit) {
        *self.slot.lock() = Slot::Ready(exit);
        self.cond.notify_all();
    }
}

/// Handle to a running program
pub struct RunHandle<A, E> {
    fiber: Arc<FiberInner>,
    completion: Arc<Completion>,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A: 'static, E: 'static> RunHandle<A, E> {
    /// Block until the program exits
    ///
    /// Calling this from inside a fiber blocks a worker; use `join` on a
    /// forked fiber there instead.
    pub fn wait(self) -> Exit<A, E> {
        if tls::is_worker_thread() {
            warn!(fiber = %self.fiber.id(), "RunHandle::wait called on a worker thread");
        }
        let mut slot = self.completion.slot.lock();
        loop {
            match mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(exit) => return exit_from_raw(exit),
                Slot::Pending => {
                    *slot = Slot::Pending;
                    self.completion.cond.wait(&mut slot);
                }
                Slot::Taken => return Err(Cause::Die(Defect::internal("run result already taken"))),
            }
        }
    }

    /// Wait at most `timeout`; `None` if the program is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Exit<A, E>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.completion.slot.lock();
        loop {
            match mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(exit) => return Some(exit_from_raw(exit)),
                Slot::Taken => return Some(Err(Cause::Die(Defect::internal("run result already taken")))),
                Slot::Pending => {
                    *slot = Slot::Pending;
                    if self.completion.cond.wait_until(&mut slot, deadline).timed_out() {
                        return match mem::replace(&mut *slot, Slot::Pending) {
                            Slot::Ready(exit) => {
                                *slot = Slot::Taken;
                                Some(exit_from_raw(exit))
                            }
                            other => {
                                *slot = other;
                                None
                            }
                        };
                    }
                }
            }
        }
    }
}

impl<A, E> RunHandle<A, E> {
    /// Interrupt the program; its finalizers still run
    pub fn cancel(&self) {
        self.fiber.interrupt_fiber();
    }

    /// Check if the program has exited
    pub fn is_finished(&self) -> bool {
        self.fiber.status().is_terminal()
    }

    /// Root fiber status
    pub fn status(&self) -> FiberStatus {
        self.fiber.status()
    }

    /// Root fiber id
    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }
}

impl<A, E> std::fmt::Debug for RunHandle<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("fiber", &self.fiber.id())
            .field("status", &self.fiber.status())
            .finish()
    }
}

//! Fibers: one in-flight execution of an effect tree
//!
//! A fiber is a heap object, not a thread. Its run state (current step,
//! frame stack, context) lives either with the worker interpreting it or,
//! while it waits, in the fiber's cell.
//!
//! # States
//!
//! ```text
//!            spawn                  park (no input yet)
//!   ────────► Running ──────────────────────────────► Suspended
//!               │  ▲                                      │
//!               │  └──────── deliver(input) / interrupt ──┘
//!               ▼
//!   finish: interrupt live children, wait for them
//!               ▼
//!   Succeeded | Failed | Died | Interrupted
//! ```
//!
//! # Locking
//!
//! Each fiber has one cell mutex. A thread never holds two cell locks at
//! once, except that coordinators may take a cell lock while holding their
//! own state lock. Callbacks (consumers, observers, cancelers) always run
//! after the cell lock is released.

use std::collections::HashMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use effex_core::effect::raw::{NodeRef, RawExit, RawResume};
use effex_core::{Canceler, Cause, Context, FiberId, FiberStatus, RawFiber};

use crate::config::RuntimeConfig;
use crate::interpreter::{RunState, Step};
use crate::memo::RunScope;
use crate::ready_queue::{GlobalQueue, ReadyQueue};
use crate::timer::{HeapTimerBackend, TimerRegistry};

/// Completion callback for a fiber's exit (single consumer)
pub(crate) type Consumer = Box<dyn FnOnce(RawExit) + Send>;

type Observer = Box<dyn FnOnce() + Send>;

/// State shared by all fibers and workers of one runtime
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) queue: GlobalQueue<Arc<FiberInner>>,
    pub(crate) timers: TimerRegistry,
    shutdown: AtomicBool,
    roots: Mutex<HashMap<FiberId, Weak<FiberInner>>>,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            queue: GlobalQueue::new(),
            timers: TimerRegistry::new(Arc::new(HeapTimerBackend::new())),
            shutdown: AtomicBool::new(false),
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// Make a fiber runnable
    #[inline]
    pub(crate) fn schedule(&self, fiber: Arc<FiberInner>) {
        self.queue.push(fiber);
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns false if shutdown was already requested
    pub(crate) fn request_shutdown(&self) -> bool {
        let first = !self.shutdown.swap(true, Ordering::AcqRel);
        self.queue.wake_all();
        first
    }

    pub(crate) fn register_root(&self, fiber: &Arc<FiberInner>) {
        self.roots.lock().insert(fiber.id(), Arc::downgrade(fiber));
    }

    pub(crate) fn unregister_root(&self, id: FiberId) {
        self.roots.lock().remove(&id);
    }

    pub(crate) fn live_roots(&self) -> Vec<Arc<FiberInner>> {
        self.roots.lock().values().filter_map(Weak::upgrade).collect()
    }
}

/// One-shot claim shared by an async callback and interruption
///
/// Whoever claims first decides how the wait ends.
pub(crate) struct AsyncSlot {
    claimed: AtomicBool,
}

impl AsyncSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            claimed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }
}

/// What a suspended fiber is waiting for
pub(crate) enum Pending {
    /// An async callback or timer; interruption may claim the slot
    Async {
        slot: Arc<AsyncSlot>,
        canceler: Option<Canceler>,
    },

    /// A race or all coordinator; ends only when every child is terminal
    Children,
}

struct FiberCell {
    status: FiberStatus,
    run: Option<RunState>,
    input: Option<RawExit>,
    pending: Option<Pending>,
    children: Vec<Arc<FiberInner>>,
    observers: Vec<Observer>,
    consumer: Option<Consumer>,
    exit: Option<RawExit>,
    parent: Weak<FiberInner>,
}

/// Runtime-side fiber object
pub(crate) struct FiberInner {
    id: FiberId,
    shared: Arc<Shared>,
    scope: Arc<RunScope>,
    interrupted: AtomicBool,
    cell: Mutex<FiberCell>,
}

impl FiberInner {
    fn create(
        shared: Arc<Shared>,
        scope: Arc<RunScope>,
        node: NodeRef,
        context: Context,
        consumer: Option<Consumer>,
        parent: Weak<FiberInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            shared,
            scope,
            interrupted: AtomicBool::new(false),
            cell: Mutex::new(FiberCell {
                status: FiberStatus::Running,
                run: Some(RunState::new(node, context)),
                input: None,
                pending: None,
                children: Vec::new(),
                observers: Vec::new(),
                consumer,
                exit: None,
                parent,
            }),
        })
    }

    /// New top-level fiber with its own layer memo (not yet started)
    pub(crate) fn new_root(shared: &Arc<Shared>, node: NodeRef, consumer: Consumer) -> Arc<Self> {
        let fiber = Self::create(
            Arc::clone(shared),
            Arc::new(RunScope::new()),
            node,
            Context::empty(),
            Some(consumer),
            Weak::new(),
        );
        trace!(fiber = %fiber.id, "root fiber spawned");
        fiber
    }

    /// New supervised child (not yet started)
    ///
    /// The child is registered with `parent` before this returns; if the
    /// parent is already interrupted, so is the child.
    pub(crate) fn new_child(
        parent: &Arc<FiberInner>,
        node: NodeRef,
        context: Context,
        consumer: Option<Consumer>,
    ) -> Arc<Self> {
        let child = Self::create(
            Arc::clone(&parent.shared),
            Arc::clone(&parent.scope),
            node,
            context,
            consumer,
            Arc::downgrade(parent),
        );
        parent.cell.lock().children.push(Arc::clone(&child));
        if parent.is_interrupted() {
            child.interrupted.store(true, Ordering::SeqCst);
        }
        trace!(fiber = %child.id, parent = %parent.id, "fiber spawned");
        child
    }

    /// Put a freshly created fiber on the ready queue
    pub(crate) fn start(self: &Arc<Self>) {
        self.shared.schedule(Arc::clone(self));
    }

    #[inline]
    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[inline]
    pub(crate) fn scope(&self) -> &Arc<RunScope> {
        &self.scope
    }

    #[inline]
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.cell.lock().status
    }

    /// Resume callback for an async wait guarded by `slot`
    pub(crate) fn resumer(self: &Arc<Self>, slot: &Arc<AsyncSlot>) -> RawResume {
        let fiber = Arc::clone(self);
        let slot = Arc::clone(slot);
        Box::new(move |exit| {
            if slot.claim() {
                fiber.deliver(exit);
            }
        })
    }

    /// Step to continue with after a wait ends with `input`
    fn resume_step(&self, input: RawExit, state: &RunState) -> Step {
        if state.uninterruptible == 0 && self.is_interrupted() {
            Step::Done(Err(Cause::Interrupt))
        } else {
            Step::Done(input)
        }
    }

    /// Take the run state to interpret it (worker side)
    pub(crate) fn take_run(&self) -> Option<RunState> {
        let (mut state, input) = {
            let mut cell = self.cell.lock();
            let state = cell.run.take()?;
            (state, cell.input.take())
        };
        if let Some(input) = input {
            state.next = self.resume_step(input, &state);
        }
        Some(state)
    }

    /// Put the run state back and reschedule (yield or budget exhausted)
    pub(crate) fn requeue(self: &Arc<Self>, state: RunState) {
        self.cell.lock().run = Some(state);
        self.shared.schedule(Arc::clone(self));
    }

    /// Suspend on `pending`
    ///
    /// Returns the state back with the next step if the wait is already
    /// over: the input arrived while the fiber was still running, or the
    /// fiber is interrupted and could claim the async slot.
    pub(crate) fn park(self: &Arc<Self>, state: RunState, pending: Pending) -> Option<(RunState, Step)> {
        let mut cell = self.cell.lock();

        if let Some(input) = cell.input.take() {
            drop(cell);
            let step = self.resume_step(input, &state);
            return Some((state, step));
        }

        let interruptible = state.uninterruptible == 0 && self.is_interrupted();
        let pending = match pending {
            Pending::Async { slot, canceler } if interruptible && slot.claim() => {
                drop(cell);
                if let Some(cancel) = canceler {
                    run_canceler(self.id, cancel);
                }
                return Some((state, Step::Done(Err(Cause::Interrupt))));
            }
            other => other,
        };

        cell.run = Some(state);
        cell.pending = Some(pending);
        cell.status = FiberStatus::Suspended;
        None
    }

    /// Hand the result of a wait to the fiber, rescheduling it if parked
    pub(crate) fn deliver(self: &Arc<Self>, exit: RawExit) {
        let schedule = {
            let mut cell = self.cell.lock();
            if cell.status.is_terminal() {
                return;
            }
            cell.input = Some(exit);
            if cell.status == FiberStatus::Suspended {
                cell.status = FiberStatus::Running;
                cell.pending = None;
                true
            } else {
                false
            }
        };
        if schedule {
            self.shared.schedule(Arc::clone(self));
        }
    }

    /// Request interruption: children first, then this fiber
    ///
    /// A fiber parked interruptibly on an async wait is resumed with
    /// `Interrupt` right away (its canceler runs here). A running fiber
    /// sees the flag at its next suspension point or budget requeue; one
    /// waiting on children resumes once they have drained.
    pub(crate) fn interrupt_fiber(self: &Arc<Self>) {
        // Set before reading the children list; `new_child` pushes before
        // reading the flag, so no child is missed.
        self.interrupted.store(true, Ordering::SeqCst);

        let (children, claimed) = {
            let mut cell = self.cell.lock();
            if cell.status.is_terminal() {
                return;
            }
            let children = cell.children.clone();
            let parked_interruptible = cell.status == FiberStatus::Suspended
                && cell.run.as_ref().is_some_and(|r| r.uninterruptible == 0);

            let claimed = if parked_interruptible {
                match cell.pending.take() {
                    Some(Pending::Async { slot, canceler }) if slot.claim() => {
                        cell.input = Some(Err(Cause::Interrupt));
                        cell.status = FiberStatus::Running;
                        Some(canceler)
                    }
                    other => {
                        cell.pending = other;
                        None
                    }
                }
            } else {
                None
            };
            (children, claimed)
        };

        trace!(fiber = %self.id, children = children.len(), "interrupting");
        for child in children {
            child.interrupt_fiber();
        }

        if let Some(canceler) = claimed {
            if let Some(cancel) = canceler {
                run_canceler(self.id, cancel);
            }
            self.shared.schedule(Arc::clone(self));
        }
    }

    /// The body is done; wait for live children, then complete
    pub(crate) fn finish(self: &Arc<Self>, exit: RawExit) {
        let children = self.cell.lock().children.clone();
        if children.is_empty() {
            self.complete(exit);
            return;
        }

        trace!(fiber = %self.id, children = children.len(), "waiting for children before exit");
        let remaining = Arc::new(AtomicUsize::new(children.len()));
        let slot = Arc::new(Mutex::new(Some(exit)));
        for child in &children {
            child.interrupt_fiber();
        }
        for child in children {
            let fiber = Arc::clone(self);
            let remaining = Arc::clone(&remaining);
            let slot = Arc::clone(&slot);
            child.on_terminal(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(exit) = slot.lock().take() {
                        fiber.complete(exit);
                    }
                }
            }));
        }
    }

    fn complete(self: &Arc<Self>, exit: RawExit) {
        let status = status_of(&exit);
        let (consumer, exit, observers, parent) = {
            let mut cell = self.cell.lock();
            cell.status = status;
            cell.run = None;
            cell.pending = None;
            cell.input = None;
            cell.children.clear();
            let observers = mem::take(&mut cell.observers);
            let parent = cell.parent.upgrade();
            match cell.consumer.take() {
                Some(consumer) => (Some(consumer), Some(exit), observers, parent),
                None => {
                    cell.exit = Some(exit);
                    (None, None, observers, parent)
                }
            }
        };

        trace!(fiber = %self.id, status = %status, "fiber exited");

        match parent {
            Some(parent) => parent.remove_child(self.id),
            None => self.shared.unregister_root(self.id),
        }
        if let (Some(consumer), Some(exit)) = (consumer, exit) {
            consumer(exit);
        }
        for observer in observers {
            observer();
        }
    }

    fn remove_child(&self, id: FiberId) {
        self.cell.lock().children.retain(|c| c.id != id);
    }

    /// Run `callback` once terminal (now, if already terminal)
    pub(crate) fn on_terminal(&self, callback: Observer) {
        let run_now = {
            let mut cell = self.cell.lock();
            if cell.status.is_terminal() {
                Some(callback)
            } else {
                cell.observers.push(callback);
                None
            }
        };
        if let Some(callback) = run_now {
            callback();
        }
    }

    /// Take the stored exit of a terminal fiber without a consumer
    pub(crate) fn take_exit(&self) -> Option<RawExit> {
        let mut cell = self.cell.lock();
        if cell.status.is_terminal() {
            cell.exit.take()
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn live_children(&self) -> usize {
        self.cell.lock().children.len()
    }
}

/// Terminal status for an exit
pub(crate) fn status_of(exit: &RawExit) -> FiberStatus {
    match exit {
        Ok(_) => FiberStatus::Succeeded,
        Err(Cause::Fail(_)) => FiberStatus::Failed,
        Err(Cause::Die(_)) => FiberStatus::Died,
        Err(Cause::Interrupt) => FiberStatus::Interrupted,
    }
}

fn run_canceler(fiber: FiberId, cancel: Canceler) {
    if panic::catch_unwind(AssertUnwindSafe(cancel)).is_err() {
        error!(fiber = %fiber, "async canceler panicked");
    }
}

/// Handle given to effects that fork a fiber
pub(crate) struct FiberRef(Arc<FiberInner>);

impl FiberRef {
    pub(crate) fn new(fiber: Arc<FiberInner>) -> Self {
        Self(fiber)
    }
}

impl RawFiber for FiberRef {
    fn id(&self) -> FiberId {
        self.0.id()
    }

    fn status(&self) -> FiberStatus {
        self.0.status()
    }

    fn on_terminal(&self, callback: Box<dyn FnOnce() + Send>) {
        self.0.on_terminal(callback);
    }

    fn take_exit(&self) -> Option<RawExit> {
        self.0.take_exit()
    }

    fn interrupt(&self) {
        self.0.interrupt_fiber();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effex_core::effect::raw::{boxed, downcast, Node};

    fn shared() -> Arc<Shared> {
        Arc::new(Shared::new(RuntimeConfig::default().num_workers(1)))
    }

    fn noop_consumer() -> Consumer {
        Box::new(|_| {})
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(&Ok(boxed(1u8))), FiberStatus::Succeeded);
        assert_eq!(status_of(&Err(Cause::Fail(boxed(1u8)))), FiberStatus::Failed);
        assert_eq!(status_of(&Err(Cause::Interrupt)), FiberStatus::Interrupted);
    }

    #[test]
    fn test_async_slot_claims_once() {
        let slot = AsyncSlot::new();
        assert!(slot.claim());
        assert!(!slot.claim());
    }

    #[test]
    fn test_child_registration_and_inherited_interrupt() {
        let shared = shared();
        let root = FiberInner::new_root(&shared, Arc::new(Node::Yield), noop_consumer());
        let a = FiberInner::new_child(&root, Arc::new(Node::Yield), Context::empty(), None);
        assert_eq!(root.live_children(), 1);
        assert!(!a.is_interrupted());

        root.interrupt_fiber();
        assert!(a.is_interrupted());

        let b = FiberInner::new_child(&root, Arc::new(Node::Yield), Context::empty(), None);
        assert!(b.is_interrupted());
    }

    #[test]
    fn test_deliver_before_park_is_not_lost() {
        let shared = shared();
        let root = FiberInner::new_root(&shared, Arc::new(Node::Yield), noop_consumer());
        let state = root.take_run().unwrap();

        let slot = AsyncSlot::new();
        let resume = root.resumer(&slot);
        resume(Ok(boxed(5u32)));

        let resumed = root.park(state, Pending::Async { slot, canceler: None });
        let (_, step) = resumed.expect("input already delivered");
        match step {
            Step::Done(Ok(v)) => assert_eq!(downcast::<u32>(v).unwrap(), 5),
            _ => panic!("expected the delivered value"),
        }
    }

    #[test]
    fn test_interrupt_claims_parked_async_and_runs_canceler() {
        let shared = shared();
        let root = FiberInner::new_root(&shared, Arc::new(Node::Yield), noop_consumer());
        let state = root.take_run().unwrap();

        let cancelled = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cancelled);
        let slot = AsyncSlot::new();
        let late_resume = root.resumer(&slot);
        let pending = Pending::Async {
            slot,
            canceler: Some(Box::new(move || c.store(true, Ordering::SeqCst))),
        };
        assert!(root.park(state, pending).is_none());
        assert_eq!(root.status(), FiberStatus::Suspended);

        root.interrupt_fiber();
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(root.status(), FiberStatus::Running);

        // the late callback lost the claim
        late_resume(Ok(boxed(())));
        let state = root.take_run().unwrap();
        assert!(matches!(state.next, Step::Done(Err(Cause::Interrupt))));
        assert_eq!(shared.queue.len(), 1);
    }

    #[test]
    fn test_complete_feeds_consumer_and_observers() {
        let shared = shared();
        let got = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        let root = FiberInner::new_root(
            &shared,
            Arc::new(Node::Yield),
            Box::new(move |exit| *g.lock() = Some(status_of(&exit))),
        );
        let observed = Arc::new(AtomicBool::new(false));
        let o = Arc::clone(&observed);
        root.on_terminal(Box::new(move || o.store(true, Ordering::SeqCst)));

        root.finish(Err(Cause::Interrupt));
        assert_eq!(*got.lock(), Some(FiberStatus::Interrupted));
        assert!(observed.load(Ordering::SeqCst));
        // consumed by the consumer, nothing stored
        assert!(root.take_exit().is_none());

        // late observers run immediately
        let late = Arc::new(AtomicBool::new(false));
        let l = Arc::clone(&late);
        root.on_terminal(Box::new(move || l.store(true, Ordering::SeqCst)));
        assert!(late.load(Ordering::SeqCst));
    }

    #[test]
    fn test_finish_waits_for_children() {
        let shared = shared();
        let root = FiberInner::new_root(&shared, Arc::new(Node::Yield), noop_consumer());
        let child = FiberInner::new_child(&root, Arc::new(Node::Yield), Context::empty(), None);

        root.finish(Ok(boxed(())));
        assert!(child.is_interrupted());
        assert_eq!(root.status(), FiberStatus::Running);

        child.finish(Err(Cause::Interrupt));
        assert_eq!(child.status(), FiberStatus::Interrupted);
        assert_eq!(root.status(), FiberStatus::Succeeded);
        assert_eq!(root.live_children(), 0);
    }
}

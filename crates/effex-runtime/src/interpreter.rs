//! Trampolined interpreter
//!
//! A worker runs a fiber in slices. Each slice loops over steps until the
//! fiber suspends, yields, exhausts its step budget or finishes:
//!
//! ```text
//!   Eval(node) ──► push frame(s) ──► Eval(child)
//!        │
//!        └──► value/cause ──► Done(exit) ──► pop frame ──► resume(frame, exit)
//! ```
//!
//! The continuation stack is a `Vec<Frame>` on the heap, so neither deep
//! left-nested chains nor long right-nested loops grow the native stack.
//!
//! User closures run under `catch_unwind`; a panic becomes a `Panic`
//! defect in the fiber, never a dead worker.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use effex_core::effect::raw::{boxed, downcast, Cont, Node, NodeRef, RawCause, RawExit};
use effex_core::layer::{LayerNode, ProvidePlan};
use effex_core::log::{self, LogSpan};
use effex_core::schedule::RawSchedule;
use effex_core::{Canceler, Cause, Context, Decision, Defect, RawFiber};

use crate::coordinator;
use crate::fiber::{AsyncSlot, FiberInner, FiberRef, Pending};
use crate::memo::{self, Lookup};

/// Steps a fiber may take before it is put back on the queue
pub(crate) const STEP_BUDGET: u32 = 2048;

/// What the fiber does next
pub(crate) enum Step {
    Eval(NodeRef),
    Done(RawExit),
}

/// Outcome of one step
pub(crate) enum Control {
    Next(Step),
    Suspend(Pending),
    Yield(Step),
}

impl Control {
    #[inline]
    fn done(exit: RawExit) -> Self {
        Control::Next(Step::Done(exit))
    }

    #[inline]
    fn eval(node: NodeRef) -> Self {
        Control::Next(Step::Eval(node))
    }

    #[inline]
    fn die(defect: Defect) -> Self {
        Self::done(Err(Cause::Die(defect)))
    }
}

/// Interpreter state of one fiber
pub(crate) struct RunState {
    pub(crate) next: Step,
    stack: Vec<Frame>,
    pub(crate) context: Context,
    pub(crate) uninterruptible: u32,
    spans: Vec<LogSpan>,
}

impl RunState {
    pub(crate) fn new(node: NodeRef, context: Context) -> Self {
        Self {
            next: Step::Eval(node),
            stack: Vec::new(),
            context,
            uninterruptible: 0,
            spans: Vec::new(),
        }
    }
}

enum Frame {
    /// Continue with the value
    FlatMap(Cont),

    /// Recover a typed failure
    Catch(Cont),

    /// Run the finalizer next, whatever the exit
    Ensuring(NodeRef),

    /// Finalizer running; holds the exit of the guarded effect
    Finalized(RawExit),

    /// Leave an uninterruptible region
    RegionEnd,

    /// Leave a `provide`
    RestoreContext(Context),

    Retry {
        node: NodeRef,
        schedule: RawSchedule,
        attempt: u32,
    },

    /// A layer build (or the wait for someone else's) is in progress
    Layers(Box<LayerBuild>),

    PopSpan,
}

struct LayerBuild {
    body: NodeRef,
    plan: Arc<ProvidePlan>,
    layers: Vec<Arc<LayerNode>>,
    next: usize,
    outer: Context,
    built: Context,
    owning: bool,
}

/// Run `f`, turning a panic into a defect
fn guard<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

/// Short description of an erased cause (failure values are opaque here)
pub(crate) fn describe(cause: &RawCause) -> String {
    match cause {
        Cause::Fail(value) => {
            if let Some(s) = value.downcast_ref::<String>() {
                format!("failed: {}", s)
            } else if let Some(s) = value.downcast_ref::<&'static str>() {
                format!("failed: {}", s)
            } else {
                "failed with a typed error".to_string()
            }
        }
        Cause::Die(defect) => format!("died: {}", defect),
        Cause::Interrupt => "interrupted".to_string(),
    }
}

/// Run one slice of `fiber`
pub(crate) fn run_slice(fiber: &Arc<FiberInner>) {
    let Some(mut state) = fiber.take_run() else {
        return;
    };
    let mut budget = STEP_BUDGET;

    loop {
        let step = mem::replace(&mut state.next, Step::Done(Ok(boxed(()))));
        let control = match step {
            Step::Eval(node) => eval(fiber, &mut state, node),
            Step::Done(exit) => match state.stack.pop() {
                Some(frame) => resume(fiber, &mut state, frame, exit),
                None => {
                    fiber.finish(exit);
                    return;
                }
            },
        };

        match control {
            Control::Next(step) => {
                state.next = step;
                budget -= 1;
                if budget == 0 {
                    observe_at_requeue(fiber, &mut state);
                    fiber.requeue(state);
                    return;
                }
            }
            Control::Yield(step) => {
                state.next = step;
                fiber.requeue(state);
                return;
            }
            Control::Suspend(pending) => match fiber.park(state, pending) {
                Some((resumed, step)) => {
                    state = resumed;
                    state.next = step;
                }
                None => return,
            },
        }
    }
}

#[inline]
fn interrupt_pending(fiber: &FiberInner, state: &RunState) -> bool {
    state.uninterruptible == 0 && fiber.is_interrupted()
}

/// Nodes at which a pending interrupt is observed: those that suspend the
/// fiber, spawn children or give up the worker
fn is_suspension_point(node: &Node) -> bool {
    matches!(
        node,
        Node::Async(_) | Node::Sleep(_) | Node::Race(_) | Node::All(..) | Node::Fork(_) | Node::Yield
    )
}

/// A budget requeue is a yield: a pending interrupt replaces the next
/// evaluation, unless that evaluation installs a finalizer or a region
fn observe_at_requeue(fiber: &FiberInner, state: &mut RunState) {
    if !interrupt_pending(fiber, state) {
        return;
    }
    if let Step::Eval(node) = &state.next {
        if !matches!(&**node, Node::Ensuring(..) | Node::Uninterruptible(_)) {
            state.next = Step::Done(Err(Cause::Interrupt));
        }
    }
}

fn eval(fiber: &Arc<FiberInner>, state: &mut RunState, node: NodeRef) -> Control {
    if is_suspension_point(&node) && interrupt_pending(fiber, state) {
        return Control::done(Err(Cause::Interrupt));
    }

    match &*node {
        Node::Succeed(thunk) => match guard(|| thunk()) {
            Ok(value) => Control::done(Ok(value)),
            Err(defect) => Control::die(defect),
        },

        Node::Fail(thunk) => match guard(|| thunk()) {
            Ok(cause) => Control::done(Err(cause)),
            Err(defect) => Control::die(defect),
        },

        Node::Sync(thunk) => match guard(|| thunk()) {
            Ok(exit) => Control::done(exit),
            Err(defect) => Control::die(defect),
        },

        Node::Exit(slot) => match slot.lock().take() {
            Some(exit) => Control::done(exit),
            None => Control::die(Defect::internal("one-shot node evaluated twice")),
        },

        Node::Async(register) => {
            let slot = AsyncSlot::new();
            let resume = fiber.resumer(&slot);
            match guard(|| register(resume)) {
                Ok(canceler) => Control::Suspend(Pending::Async { slot, canceler }),
                // the callback may already have completed before panicking
                Err(defect) if slot.claim() => Control::die(defect),
                Err(_) => Control::Suspend(Pending::Async { slot, canceler: None }),
            }
        }

        Node::FlatMap(source, k) => {
            state.stack.push(Frame::FlatMap(Arc::clone(k)));
            Control::eval(Arc::clone(source))
        }

        Node::Catch(source, handler) => {
            state.stack.push(Frame::Catch(Arc::clone(handler)));
            Control::eval(Arc::clone(source))
        }

        Node::Ensuring(source, finalizer) => {
            state.stack.push(Frame::Ensuring(Arc::clone(finalizer)));
            Control::eval(Arc::clone(source))
        }

        Node::Uninterruptible(source) => {
            state.uninterruptible += 1;
            state.stack.push(Frame::RegionEnd);
            Control::eval(Arc::clone(source))
        }

        Node::Provide(body, plan) => provide(fiber, state, body, plan),

        Node::Race(children) => coordinator::race(fiber, &state.context, children),

        Node::All(children, options) => coordinator::all(fiber, &state.context, children, *options),

        Node::Retry(source, schedule) => {
            state.stack.push(Frame::Retry {
                node: Arc::clone(source),
                schedule: Arc::clone(schedule),
                attempt: 0,
            });
            Control::eval(Arc::clone(source))
        }

        Node::Sleep(duration) => sleep(fiber, *duration),

        Node::AccessContext(reader) => match guard(|| reader(&state.context)) {
            Ok(next) => Control::eval(next),
            Err(defect) => Control::die(defect),
        },

        Node::Fork(source) => {
            let child = FiberInner::new_child(fiber, Arc::clone(source), state.context.clone(), None);
            child.start();
            let handle: Arc<dyn RawFiber> = Arc::new(FiberRef::new(child));
            Control::done(Ok(boxed(handle)))
        }

        Node::Log(level, message) => {
            log::emit(*level, fiber.id(), &state.spans, message);
            Control::done(Ok(boxed(())))
        }

        Node::LogSpan(label, source) => {
            state.spans.push(LogSpan::enter(Arc::clone(label)));
            state.stack.push(Frame::PopSpan);
            Control::eval(Arc::clone(source))
        }

        Node::Yield => Control::Yield(Step::Done(Ok(boxed(())))),
    }
}

fn resume(fiber: &Arc<FiberInner>, state: &mut RunState, frame: Frame, exit: RawExit) -> Control {
    match frame {
        Frame::FlatMap(k) => match exit {
            Ok(value) => match guard(move || k(value)) {
                Ok(next) => Control::eval(next),
                Err(defect) => Control::die(defect),
            },
            Err(cause) => Control::done(Err(cause)),
        },

        Frame::Catch(handler) => match exit {
            Err(Cause::Fail(error)) => match guard(move || handler(error)) {
                Ok(next) => Control::eval(next),
                Err(defect) => Control::die(defect),
            },
            other => Control::done(other),
        },

        Frame::Ensuring(finalizer) => {
            state.uninterruptible += 1;
            state.stack.push(Frame::Finalized(exit));
            Control::eval(finalizer)
        }

        Frame::Finalized(original) => {
            state.uninterruptible = state.uninterruptible.saturating_sub(1);
            match exit {
                Ok(_) => Control::done(original),
                Err(cause) => {
                    warn!(fiber = %fiber.id(), cause = %describe(&cause), "finalizer failed");
                    match original {
                        Ok(_) => Control::done(Err(cause)),
                        Err(first) => Control::done(Err(first)),
                    }
                }
            }
        }

        Frame::RegionEnd => {
            state.uninterruptible = state.uninterruptible.saturating_sub(1);
            Control::done(exit)
        }

        Frame::RestoreContext(context) => {
            state.context = context;
            Control::done(exit)
        }

        Frame::PopSpan => {
            state.spans.pop();
            Control::done(exit)
        }

        Frame::Retry { node, schedule, attempt } => match exit {
            Err(Cause::Fail(error)) => match guard(|| schedule(attempt, &*error)) {
                Ok(Decision::Continue(delay)) => {
                    debug!(fiber = %fiber.id(), attempt = attempt + 1, delay = ?delay, "retrying");
                    state.stack.push(Frame::Retry {
                        node: Arc::clone(&node),
                        schedule,
                        attempt: attempt.saturating_add(1),
                    });
                    if delay.is_zero() {
                        Control::eval(node)
                    } else {
                        state.stack.push(Frame::FlatMap(Arc::new(move |_| Arc::clone(&node))));
                        Control::eval(Arc::new(Node::Sleep(delay)))
                    }
                }
                Ok(Decision::Stop) => {
                    debug!(fiber = %fiber.id(), attempts = attempt + 1, "retry schedule exhausted");
                    Control::done(Err(Cause::Fail(error)))
                }
                Err(defect) => Control::die(defect),
            },
            other => Control::done(other),
        },

        Frame::Layers(build) => layers_resume(fiber, state, build, exit),
    }
}

fn sleep(fiber: &Arc<FiberInner>, duration: Duration) -> Control {
    if duration.is_zero() {
        return Control::Yield(Step::Done(Ok(boxed(()))));
    }
    let slot = AsyncSlot::new();
    let resume = fiber.resumer(&slot);
    let timers = fiber.shared().timers.clone();
    let handle = timers.schedule(duration, Box::new(move || resume(Ok(boxed(())))));
    let canceler: Canceler = Box::new(move || {
        timers.cancel(handle);
    });
    Control::Suspend(Pending::Async {
        slot,
        canceler: Some(canceler),
    })
}

// ============================================================================
// Layers
// ============================================================================

fn provide(fiber: &Arc<FiberInner>, state: &mut RunState, body: &NodeRef, plan: &Arc<ProvidePlan>) -> Control {
    let layers = match plan.layers() {
        Ok(layers) => layers.to_vec(),
        Err(err) => return Control::die(Defect::layer(err)),
    };
    let outer = state.context.clone();
    state.stack.push(Frame::RestoreContext(outer.clone()));
    let build = LayerBuild {
        body: Arc::clone(body),
        plan: Arc::clone(plan),
        layers,
        next: 0,
        outer,
        built: Context::empty(),
        owning: false,
    };
    advance_layers(fiber, state, Box::new(build))
}

/// Walk the plan from `build.next`: reuse memoized layers, build or wait
/// for the first one that is not ready, or run the body once all are
fn advance_layers(fiber: &Arc<FiberInner>, state: &mut RunState, mut build: Box<LayerBuild>) -> Control {
    while let Some(layer) = build.layers.get(build.next).cloned() {
        match fiber.scope().lookup_or_claim(&layer, fiber.id()) {
            Lookup::Built(ctx) => {
                build.built = build.built.merge(&ctx);
                build.next += 1;
            }
            Lookup::Claimed => {
                state.context = build.outer.merge(&build.built);
                build.owning = true;
                let node = Arc::clone(layer.build());
                state.stack.push(Frame::Layers(build));
                return Control::eval(node);
            }
            Lookup::Busy => {
                build.owning = false;
                let node = memo::wait_node(fiber.scope(), layer.id());
                state.stack.push(Frame::Layers(build));
                return Control::eval(node);
            }
        }
    }

    let visible = build.built.restrict(build.plan.exports());
    state.context = build.outer.merge(&visible);
    Control::eval(Arc::clone(&build.body))
}

fn layers_resume(fiber: &Arc<FiberInner>, state: &mut RunState, mut build: Box<LayerBuild>, exit: RawExit) -> Control {
    if !build.owning {
        // woken by the owner; look again
        return match exit {
            Ok(_) => advance_layers(fiber, state, build),
            Err(cause) => Control::done(Err(cause)),
        };
    }

    let Some(layer) = build.layers.get(build.next).cloned() else {
        return Control::die(Defect::internal("layer build frame out of range"));
    };
    build.owning = false;
    state.context = build.outer.clone();
    let scope = fiber.scope();

    match exit {
        Ok(value) => match downcast::<Context>(value) {
            Ok(ctx) => {
                scope.complete(&layer, ctx.clone());
                build.built = build.built.merge(&ctx);
                build.next += 1;
                advance_layers(fiber, state, build)
            }
            Err(defect) => {
                let cause = Cause::Die(defect);
                scope.fail(&layer, &cause);
                Control::done(Err(cause))
            }
        },
        Err(Cause::Interrupt) => {
            scope.abandon(&layer);
            Control::done(Err(Cause::Interrupt))
        }
        Err(cause) => {
            debug!(layer = layer.name(), cause = %describe(&cause), "layer build failed");
            scope.fail(&layer, &cause);
            Control::done(Err(cause))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_converts_panics() {
        assert_eq!(guard(|| 5), Ok(5));
        let defect = guard(|| -> u32 { panic!("kaboom") }).unwrap_err();
        assert_eq!(defect.kind(), effex_core::DefectKind::Panic);
        assert_eq!(defect.message(), "kaboom");
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&Cause::Fail(boxed("bad".to_string()))), "failed: bad");
        assert_eq!(describe(&Cause::Fail(boxed(3u8))), "failed with a typed error");
        assert_eq!(describe(&Cause::Interrupt), "interrupted");
        assert!(describe(&Cause::Die(Defect::custom("x"))).starts_with("died:"));
    }
}

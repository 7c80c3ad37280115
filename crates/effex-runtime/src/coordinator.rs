//! Race and all coordinators
//!
//! Both run their children as supervised fibers and park the parent on
//! `Pending::Children`. The parent is resumed only once every child it
//! started is terminal, so losers and cancelled siblings are always drained
//! before the combinator returns.
//!
//! Lock order: coordinator state, then a fiber cell. Child exits arrive
//! through the child's consumer, which runs with no cell lock held.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use effex_core::effect::concurrency::RawSlots;
use effex_core::effect::raw::{boxed, NodeRef, RawCause, RawExit, Value};
use effex_core::{AllMode, AllOptions, Cause, Context, Defect};

use crate::fiber::{FiberInner, Pending};
use crate::interpreter::{Control, Step};

// ============================================================================
// Race
// ============================================================================

struct RaceState {
    winner: Option<RawExit>,
    remaining: usize,
    fibers: Vec<Arc<FiberInner>>,
}

struct RaceCoordinator {
    parent: Arc<FiberInner>,
    state: Mutex<RaceState>,
}

impl RaceCoordinator {
    fn child_exit(&self, exit: RawExit) {
        let (losers, done) = {
            let mut st = self.state.lock();
            st.remaining -= 1;
            let losers = if st.winner.is_none() {
                st.winner = Some(exit);
                st.fibers.clone()
            } else {
                Vec::new()
            };
            let done = if st.remaining == 0 {
                st.fibers.clear();
                st.winner.take()
            } else {
                None
            };
            (losers, done)
        };

        if !losers.is_empty() {
            trace!(fiber = %self.parent.id(), losers = losers.len() - 1, "race settled");
        }
        // the winner is already terminal, so this only reaches the losers
        for fiber in losers {
            fiber.interrupt_fiber();
        }
        if let Some(exit) = done {
            self.parent.deliver(exit);
        }
    }
}

/// Start every child; the first to settle decides the result
pub(crate) fn race(parent: &Arc<FiberInner>, context: &Context, children: &[NodeRef]) -> Control {
    if children.is_empty() {
        return Control::Next(Step::Done(Err(Cause::Die(Defect::internal("race of no effects")))));
    }

    let coord = Arc::new(RaceCoordinator {
        parent: Arc::clone(parent),
        state: Mutex::new(RaceState {
            winner: None,
            remaining: children.len(),
            fibers: Vec::new(),
        }),
    });

    // All children exist before any runs, so the first exit sees every loser.
    let fibers: Vec<Arc<FiberInner>> = children
        .iter()
        .map(|node| {
            let coord = Arc::clone(&coord);
            FiberInner::new_child(
                parent,
                Arc::clone(node),
                context.clone(),
                Some(Box::new(move |exit| coord.child_exit(exit))),
            )
        })
        .collect();
    coord.state.lock().fibers = fibers.clone();
    for fiber in &fibers {
        fiber.start();
    }

    Control::Suspend(Pending::Children)
}

// ============================================================================
// All
// ============================================================================

struct AllState {
    queue: VecDeque<(usize, NodeRef)>,
    running: Vec<(usize, Arc<FiberInner>)>,
    results: Vec<Option<Result<Value, Value>>>,
    failure: Option<RawCause>,
    limit: usize,
    mode: AllMode,
    context: Context,
}

impl AllState {
    /// Stop admitting children; returns the in-flight ones to interrupt
    fn fail(&mut self, cause: RawCause) -> Vec<Arc<FiberInner>> {
        if self.failure.is_some() {
            return Vec::new();
        }
        self.failure = Some(cause);
        self.queue.clear();
        self.running.iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    fn finish(&mut self) -> RawExit {
        if let Some(cause) = self.failure.take() {
            return Err(cause);
        }
        let mut slots: RawSlots = Vec::with_capacity(self.results.len());
        for slot in self.results.drain(..) {
            match slot {
                Some(result) => slots.push(result),
                None => return Err(Cause::Die(Defect::internal("all: child finished without a result"))),
            }
        }
        Ok(boxed(slots))
    }
}

struct AllCoordinator {
    parent: Arc<FiberInner>,
    state: Mutex<AllState>,
}

impl AllCoordinator {
    /// Start queued children up to the limit
    fn fill(self: &Arc<Self>) {
        let started = {
            let mut st = self.state.lock();
            let mut started = Vec::new();
            while st.failure.is_none() && st.running.len() < st.limit {
                let Some((index, node)) = st.queue.pop_front() else {
                    break;
                };
                let coord = Arc::clone(self);
                let child = FiberInner::new_child(
                    &self.parent,
                    node,
                    st.context.clone(),
                    Some(Box::new(move |exit| coord.child_exit(index, exit))),
                );
                st.running.push((index, Arc::clone(&child)));
                started.push(child);
            }
            started
        };
        for child in started {
            child.start();
        }
    }

    fn child_exit(self: &Arc<Self>, index: usize, exit: RawExit) {
        let (interrupt, done) = {
            let mut st = self.state.lock();
            st.running.retain(|(i, _)| *i != index);

            let mut interrupt = Vec::new();
            match exit {
                Ok(value) => st.results[index] = Some(Ok(value)),
                Err(Cause::Fail(error)) if st.mode == AllMode::CollectAll => {
                    st.results[index] = Some(Err(error));
                }
                Err(cause) => interrupt.extend(st.fail(cause)),
            }
            if self.parent.is_interrupted() {
                interrupt.extend(st.fail(Cause::Interrupt));
            }

            let done = if st.running.is_empty() && st.queue.is_empty() {
                Some(st.finish())
            } else {
                None
            };
            (interrupt, done)
        };

        if !interrupt.is_empty() {
            trace!(fiber = %self.parent.id(), siblings = interrupt.len(), "all failed, interrupting siblings");
        }
        for fiber in interrupt {
            fiber.interrupt_fiber();
        }
        match done {
            Some(exit) => self.parent.deliver(exit),
            None => self.fill(),
        }
    }
}

/// Run children with at most `options.concurrency` live; results in input order
pub(crate) fn all(parent: &Arc<FiberInner>, context: &Context, children: &[NodeRef], options: AllOptions) -> Control {
    if children.is_empty() {
        return Control::Next(Step::Done(Ok(boxed(RawSlots::new()))));
    }

    let n = children.len();
    let coord = Arc::new(AllCoordinator {
        parent: Arc::clone(parent),
        state: Mutex::new(AllState {
            queue: children.iter().cloned().enumerate().collect(),
            running: Vec::new(),
            results: (0..n).map(|_| None).collect(),
            failure: None,
            limit: options.concurrency.limit(n),
            mode: options.mode,
            context: context.clone(),
        }),
    });
    coord.fill();

    Control::Suspend(Pending::Children)
}

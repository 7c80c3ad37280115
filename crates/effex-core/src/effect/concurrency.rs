//! Concurrent combinators and fiber handles
//!
//! Every child started here is supervised by the fiber that started it:
//! interrupting the parent interrupts the children first, and a parent
//! never becomes terminal while a child is still live.

use core::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Defect, Exit};
use crate::context::Requirements;
use crate::id::FiberId;
use crate::state::FiberStatus;
use crate::traits::RawFiber;

use super::raw::{boxed, downcast, exit_from_raw, Node, NodeRef, RawExit, Value};
use super::Effect;

/// How many children of an `all` may be live at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// Start every child immediately
    #[default]
    Unbounded,

    /// At most `n` live children (`0` is treated as `1`)
    Bounded(usize),
}

impl Concurrency {
    /// Effective limit for `n` children
    pub fn limit(&self, n: usize) -> usize {
        match self {
            Concurrency::Unbounded => n.max(1),
            Concurrency::Bounded(k) => (*k).clamp(1, n.max(1)),
        }
    }
}

/// What `all` does when a child fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllMode {
    /// Interrupt in-flight siblings, drain them, surface the first failure
    #[default]
    FailFast,

    /// Let every child finish; typed failures are recorded per slot.
    /// Defects and interruption still fail fast.
    CollectAll,
}

/// Options for [`Effect::all_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllOptions {
    /// Live-children bound
    pub concurrency: Concurrency,
    /// Failure handling
    pub mode: AllMode,
}

impl AllOptions {
    /// Fail-fast with at most `n` live children
    pub fn bounded(n: usize) -> Self {
        Self {
            concurrency: Concurrency::Bounded(n),
            mode: AllMode::FailFast,
        }
    }

    /// Same options in collect-all mode
    pub fn collect_all(mut self) -> Self {
        self.mode = AllMode::CollectAll;
        self
    }
}

/// Raw output of an `All` node: one slot per child, in input order.
/// `Err` holds a typed failure (collect-all mode only).
pub type RawSlots = Vec<Result<Value, Value>>;

fn union_requirements<'a, I>(effects: I) -> Requirements
where
    I: IntoIterator<Item = &'a Requirements>,
{
    effects
        .into_iter()
        .fold(Requirements::none(), |acc, r| acc.union(r))
}

impl<A: Send + 'static, E: Send + 'static> Effect<A, E> {
    /// Run both; the first to settle (success or failure) wins and the
    /// other is interrupted and drained before the result is returned
    pub fn race(self, other: Effect<A, E>) -> Effect<A, E> {
        Self::race_all(vec![self, other])
    }

    /// Race any number of effects. Racing nothing is a defect.
    pub fn race_all<I>(effects: I) -> Effect<A, E>
    where
        I: IntoIterator<Item = Effect<A, E>>,
    {
        let effects: Vec<Effect<A, E>> = effects.into_iter().collect();
        let requires = union_requirements(effects.iter().map(|e| &e.requires));
        let children: Vec<NodeRef> = effects.into_iter().map(|e| e.node).collect();
        Effect::wrap(Node::Race(children), requires)
    }

    /// Run all concurrently (unbounded, fail-fast); results in input order
    pub fn all<I>(effects: I) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = Effect<A, E>>,
    {
        Self::all_with(effects, AllOptions::default())
    }

    /// Run all with explicit concurrency and failure mode
    ///
    /// In collect-all mode every child runs to completion and the result is
    /// the first typed failure by input position, if any.
    pub fn all_with<I>(effects: I, options: AllOptions) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = Effect<A, E>>,
    {
        let (node, requires) = Self::all_node(effects, options);
        Effect::wrap(
            Node::FlatMap(
                node,
                Arc::new(|v| match downcast::<RawSlots>(v) {
                    Ok(slots) => {
                        let mut out = Vec::with_capacity(slots.len());
                        for slot in slots {
                            match slot {
                                Ok(v) => match downcast::<A>(v) {
                                    Ok(a) => out.push(a),
                                    Err(d) => return Node::die(d),
                                },
                                Err(e) => return Node::cause(Cause::Fail(e)),
                            }
                        }
                        Node::value(boxed(out))
                    }
                    Err(d) => Node::die(d),
                }),
            ),
            requires,
        )
    }

    /// Run all to completion and report each outcome; typed failures never
    /// fail the whole (defects and interruption still do)
    pub fn all_settled<I, E2>(effects: I, concurrency: Concurrency) -> Effect<Vec<Result<A, E>>, E2>
    where
        I: IntoIterator<Item = Effect<A, E>>,
        E2: Send + 'static,
    {
        let options = AllOptions {
            concurrency,
            mode: AllMode::CollectAll,
        };
        let (node, requires) = Self::all_node(effects, options);
        Effect::wrap(
            Node::FlatMap(
                node,
                Arc::new(|v| match downcast::<RawSlots>(v) {
                    Ok(slots) => {
                        let mut out: Vec<Result<A, E>> = Vec::with_capacity(slots.len());
                        for slot in slots {
                            let typed = match slot {
                                Ok(v) => downcast::<A>(v).map(Ok),
                                Err(e) => downcast::<E>(e).map(Err),
                            };
                            match typed {
                                Ok(r) => out.push(r),
                                Err(d) => return Node::die(d),
                            }
                        }
                        Node::value(boxed(out))
                    }
                    Err(d) => Node::die(d),
                }),
            ),
            requires,
        )
    }

    /// Map each item to an effect and run them as [`Effect::all_with`]
    pub fn for_each<T, I, F>(items: I, f: F, options: AllOptions) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Effect<A, E>,
    {
        Self::all_with(items.into_iter().map(f), options)
    }

    fn all_node<I>(effects: I, options: AllOptions) -> (NodeRef, Requirements)
    where
        I: IntoIterator<Item = Effect<A, E>>,
    {
        let effects: Vec<Effect<A, E>> = effects.into_iter().collect();
        let requires = union_requirements(effects.iter().map(|e| &e.requires));
        let children = effects.into_iter().map(|e| e.node).collect();
        (Arc::new(Node::All(children, options)), requires)
    }

    /// Die with a timeout defect unless `self` settles within `duration`
    ///
    /// `self` is interrupted when the timer wins.
    pub fn timeout(self, duration: Duration) -> Effect<A, E> {
        let timer = Effect::<(), E>::sleep(duration).zip_right(Effect::die(Defect::timeout(duration)));
        self.race(timer)
    }

    /// Fail with `on_timeout()` unless `self` settles within `duration`
    pub fn timeout_fail<F>(self, duration: Duration, on_timeout: F) -> Effect<A, E>
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        let timer = Effect::<(), E>::sleep(duration).zip_right(Effect::wrap(
            Node::Fail(Arc::new(move || Cause::Fail(boxed(on_timeout())))),
            Requirements::none(),
        ));
        self.race(timer)
    }

    /// Start `self` in a supervised child fiber and return its handle
    pub fn fork<E2: Send + 'static>(self) -> Effect<Fiber<A, E>, E2> {
        let requires = self.requires.clone();
        Effect::wrap(
            Node::FlatMap(
                Arc::new(Node::Fork(self.node)),
                Arc::new(|v| match downcast::<Arc<dyn RawFiber>>(v) {
                    Ok(raw) => Node::value(boxed(Fiber::<A, E>::from_raw(raw))),
                    Err(d) => Node::die(d),
                }),
            ),
            requires,
        )
    }
}

/// Typed handle to a forked fiber
pub struct Fiber<A, E> {
    raw: Arc<dyn RawFiber>,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            _types: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.raw.id())
            .field("status", &self.raw.status())
            .finish()
    }
}

impl<A: Send + 'static, E: Send + 'static> Fiber<A, E> {
    /// Wrap a runtime handle
    #[doc(hidden)]
    pub fn from_raw(raw: Arc<dyn RawFiber>) -> Self {
        Self {
            raw,
            _types: PhantomData,
        }
    }

    /// Fiber id
    pub fn id(&self) -> FiberId {
        self.raw.id()
    }

    /// Current status
    pub fn status(&self) -> FiberStatus {
        self.raw.status()
    }

    fn await_raw<B, E2, F>(&self, convert: F) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
        F: Fn(RawExit) -> RawExit + Send + Sync + 'static,
    {
        let raw = Arc::clone(&self.raw);
        let convert = Arc::new(convert);
        Effect::wrap(
            Node::Async(Arc::new(move |resume| {
                let target = Arc::clone(&raw);
                let convert = Arc::clone(&convert);
                raw.on_terminal(Box::new(move || {
                    let exit = target
                        .take_exit()
                        .unwrap_or_else(|| Err(Cause::Die(Defect::internal("fiber exit already consumed"))));
                    resume(convert(exit));
                }));
                None
            })),
            Requirements::none(),
        )
    }

    /// Wait for the fiber and adopt its exit
    ///
    /// The exit is handed to a single consumer; joining twice is a defect.
    pub fn join(&self) -> Effect<A, E> {
        self.await_raw(|exit| exit)
    }

    /// Wait for the fiber and return its exit as a value
    pub fn await_exit<E2: Send + 'static>(&self) -> Effect<Exit<A, E>, E2> {
        self.await_raw(|exit| Ok(boxed(exit_from_raw::<A, E>(exit))))
    }

    /// Interrupt the fiber; completes once it is terminal
    pub fn interrupt<E2: Send + 'static>(&self) -> Effect<(), E2> {
        let raw = Arc::clone(&self.raw);
        Effect::wrap(
            Node::Async(Arc::new(move |resume| {
                raw.interrupt();
                raw.on_terminal(Box::new(move || resume(Ok(boxed(())))));
                None
            })),
            Requirements::none(),
        )
    }
}

//! Sequential combinators

use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Tagged};
use crate::context::{Requirements, Tag};
use crate::layer::Layer;
use crate::schedule::{Decision, RawSchedule, Schedule};

use super::raw::{boxed, downcast, once_value, Node, NodeRef};
use super::Effect;

impl<A: Send + 'static, E: Send + 'static> Effect<A, E> {
    /// Transform the success value
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::wrap(
            Node::FlatMap(
                self.node,
                Arc::new(move |v| match downcast::<A>(v) {
                    Ok(a) => Node::value(boxed(f(a))),
                    Err(d) => Node::die(d),
                }),
            ),
            self.requires,
        )
    }

    /// Sequence: run `f` on the success value
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::wrap(
            Node::FlatMap(
                self.node,
                Arc::new(move |v| match downcast::<A>(v) {
                    Ok(a) => f(a).node,
                    Err(d) => Node::die(d),
                }),
            ),
            self.requires,
        )
    }

    /// Alias of [`Effect::flat_map`]
    pub fn and_then<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        self.flat_map(f)
    }

    /// Run `next` after `self`, keeping `next`'s value
    pub fn zip_right<B: Send + 'static>(self, next: Effect<B, E>) -> Effect<B, E> {
        let requires = self.requires.union(&next.requires);
        let next = next.node;
        Effect::wrap(Node::FlatMap(self.node, Arc::new(move |_| Arc::clone(&next))), requires)
    }

    /// Alias of [`Effect::zip_right`]
    pub fn then<B: Send + 'static>(self, next: Effect<B, E>) -> Effect<B, E> {
        self.zip_right(next)
    }

    /// Run an effect on a borrow of the value, keeping the value
    pub fn tap<B, F>(self, f: F) -> Effect<A, E>
    where
        B: Send + 'static,
        F: Fn(&A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::wrap(
            Node::FlatMap(
                self.node,
                Arc::new(move |v| match downcast::<A>(v) {
                    Ok(a) => {
                        let side = f(&a).node;
                        Arc::new(Node::FlatMap(side, once_value(boxed(a))))
                    }
                    Err(d) => Node::die(d),
                }),
            ),
            self.requires,
        )
    }

    /// Discard the value
    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Transform the typed failure
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Effect::wrap(
            Node::Catch(
                self.node,
                Arc::new(move |v| match downcast::<E>(v) {
                    Ok(e) => Node::cause(Cause::Fail(boxed(f(e)))),
                    Err(d) => Node::die(d),
                }),
            ),
            self.requires,
        )
    }

    /// Recover from every typed failure
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::wrap(
            Node::Catch(
                self.node,
                Arc::new(move |v| match downcast::<E>(v) {
                    Ok(e) => f(e).node,
                    Err(d) => Node::die(d),
                }),
            ),
            self.requires,
        )
    }

    /// Recover only failures whose [`Tagged::tag`] equals `tag`
    ///
    /// Other failures re-propagate unchanged.
    pub fn catch_tag<F>(self, tag: &'static str, f: F) -> Effect<A, E>
    where
        E: Tagged,
        F: Fn(E) -> Effect<A, E> + Send + Sync + 'static,
    {
        self.catch_tags(CatchTags::new().on(tag, f))
    }

    /// Recover failures by tag with one handler per tag
    pub fn catch_tags(self, handlers: CatchTags<A, E>) -> Effect<A, E>
    where
        E: Tagged,
    {
        let handlers = Arc::new(handlers.handlers);
        Effect::wrap(
            Node::Catch(
                self.node,
                Arc::new(move |v| match downcast::<E>(v) {
                    Ok(e) => match handlers.iter().find(|(t, _)| *t == e.tag()) {
                        Some((_, handler)) => handler(e).node,
                        None => Node::cause(Cause::Fail(boxed(e))),
                    },
                    Err(d) => Node::die(d),
                }),
            ),
            self.requires,
        )
    }

    /// Move the typed failure into the success channel
    pub fn either<E2: Send + 'static>(self) -> Effect<Result<A, E>, E2> {
        self.map(Ok::<A, E>).catch_all(|e| {
            Effect::from_node(Node::value(boxed(Err::<A, E>(e))), Requirements::none())
        })
    }

    /// Run `finalizer` after `self` on success, failure, defect and interruption
    ///
    /// The finalizer runs uninterruptibly. If it fails, its failure replaces
    /// a successful result; an earlier failure of `self` is kept.
    pub fn ensuring<X: Send + 'static>(self, finalizer: Effect<X, E>) -> Effect<A, E> {
        let requires = self.requires.union(&finalizer.requires);
        Effect::wrap(Node::Ensuring(self.node, finalizer.node), requires)
    }

    /// Defer interruption until `self` completes
    pub fn uninterruptible(self) -> Effect<A, E> {
        Effect::wrap(Node::Uninterruptible(self.node), self.requires)
    }

    /// Acquire a resource uninterruptibly, use it, and always release it
    ///
    /// `use_` and `release` are called inside the guarded region, so a
    /// panic while building either step still reaches the release.
    pub fn acquire_use_release<R, U, Rel, X>(acquire: Effect<R, E>, use_: U, release: Rel) -> Effect<A, E>
    where
        R: Clone + Send + Sync + 'static,
        X: Send + 'static,
        U: Fn(R) -> Effect<A, E> + Send + Sync + 'static,
        Rel: Fn(R) -> Effect<X, E> + Send + Sync + 'static,
    {
        let use_ = Arc::new(use_);
        let release = Arc::new(release);
        acquire.uninterruptible().flat_map(move |resource: R| {
            let (use_, release) = (Arc::clone(&use_), Arc::clone(&release));
            let held = resource.clone();
            Effect::<(), E>::unit()
                .flat_map(move |_| use_(resource.clone()))
                .ensuring(Effect::<(), E>::unit().flat_map(move |_| release(held.clone())))
        })
    }

    /// Satisfy requirements from a layer
    ///
    /// The result requires what `self` requires minus the layer's exports,
    /// plus whatever the layer itself still needs.
    pub fn provide(self, layer: &Layer<E>) -> Effect<A, E> {
        let requires = self
            .requires
            .without(layer.exports().ids())
            .union(&layer.requirements());
        Effect::wrap(Node::Provide(self.node, Arc::new(layer.provide_plan())), requires)
    }

    /// Satisfy one requirement with a ready service
    pub fn provide_service<S>(self, tag: &Tag<S>, service: Arc<S>) -> Effect<A, E>
    where
        E: Clone,
        S: ?Sized + Send + Sync + 'static,
    {
        self.provide(&Layer::succeed(tag, service))
    }

    /// Declare a requirement of a continuation
    pub fn requires<S: ?Sized>(mut self, tag: &Tag<S>) -> Effect<A, E> {
        self.requires.insert(tag.id(), tag.name());
        self
    }

    /// Re-run on typed failure while `schedule` continues
    ///
    /// The schedule sees the zero-based attempt index and the failure. When
    /// it stops, the most recent failure is the result. Defects and
    /// interruption are never retried.
    pub fn retry(self, schedule: Schedule<E>) -> Effect<A, E> {
        Effect::wrap(Node::Retry(self.node, schedule.into_raw()), self.requires)
    }

    /// Retry up to `n` more times with no delay
    pub fn retry_n(self, n: u32) -> Effect<A, E> {
        self.retry(Schedule::recurs(n))
    }

    /// Re-run on success while `schedule` continues; the last value is the result
    pub fn repeat(self, schedule: Schedule<A>) -> Effect<A, E> {
        let requires = self.requires.clone();
        Effect::from_node(repeat_node(self.node, schedule.into_raw(), 0), requires)
    }

    /// Sleep, then run `self`
    pub fn delay(self, duration: Duration) -> Effect<A, E> {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }

    /// Run inside a named log span; log lines carry `label=<elapsed>ms`
    pub fn with_log_span(self, label: impl Into<String>) -> Effect<A, E> {
        let label: String = label.into();
        Effect::wrap(Node::LogSpan(Arc::from(label), self.node), self.requires)
    }
}

fn repeat_node(node: NodeRef, schedule: RawSchedule, attempt: u32) -> NodeRef {
    let source = Arc::clone(&node);
    Arc::new(Node::FlatMap(
        source,
        Arc::new(move |v| match schedule(attempt, v.as_ref()) {
            Decision::Stop => Node::value(v),
            Decision::Continue(d) => {
                let again = repeat_node(Arc::clone(&node), Arc::clone(&schedule), attempt.saturating_add(1));
                if d.is_zero() {
                    again
                } else {
                    Arc::new(Node::FlatMap(Arc::new(Node::Sleep(d)), Arc::new(move |_| Arc::clone(&again))))
                }
            }
        }),
    ))
}

type Handler<A, E> = Box<dyn Fn(E) -> Effect<A, E> + Send + Sync>;

/// Per-tag failure handlers for [`Effect::catch_tags`]
pub struct CatchTags<A, E> {
    handlers: Vec<(&'static str, Handler<A, E>)>,
}

impl<A, E> CatchTags<A, E> {
    /// No handlers
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Handle failures tagged `tag`; the first matching registration wins
    pub fn on<F>(mut self, tag: &'static str, f: F) -> Self
    where
        F: Fn(E) -> Effect<A, E> + Send + Sync + 'static,
    {
        self.handlers.push((tag, Box::new(f)));
        self
    }
}

impl<A, E> Default for CatchTags<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

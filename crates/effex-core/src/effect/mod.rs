//! The `Effect` type
//!
//! An [`Effect<A, E>`] is an immutable description of work that, when run
//! by a runtime, succeeds with `A`, fails with `E`, dies with a defect or is
//! interrupted. Building and combining effects never runs anything.
//!
//! ```ignore
//! let program: Effect<u32, String> = Effect::sync(|| 20)
//!     .map(|n| n + 1)
//!     .flat_map(|n| if n > 10 { Effect::succeed(n * 2) } else { Effect::fail("small".into()) })
//!     .retry(Schedule::recurs(3));
//! ```
//!
//! # Requirements
//!
//! Each effect carries the set of service tags it needs
//! ([`Effect::requirements`]). `service` adds a tag, combinators union the
//! sets of their statically known operands, `provide` removes what the
//! layer exports. Continuations passed to `flat_map` are opaque until they
//! run, so a service used only inside one must be declared with
//! [`Effect::requires`] for the runtime's pre-flight check to see it.
//!
//! # Module layout
//!
//! - `raw` - the erased node tree the interpreter walks
//! - `sequential` - map/flat_map/error handling/finalizers/layers/retry
//! - `concurrency` - race, all, timeout, fork and fiber handles

use core::fmt;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::Level;

use crate::cause::{Cause, Defect, Exit};
use crate::context::{Context, Requirements, Tag};

pub mod concurrency;
#[doc(hidden)]
pub mod raw;
mod sequential;

pub use concurrency::{AllMode, AllOptions, Concurrency, Fiber};
pub use raw::Canceler;
pub use sequential::CatchTags;

use raw::{boxed, exit_into_raw, Node, NodeRef, RawResume};

/// Lazy description of a computation succeeding with `A` or failing with `E`
pub struct Effect<A, E = Infallible> {
    node: NodeRef,
    requires: Requirements,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            requires: self.requires.clone(),
            _types: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("node", &self.node.name())
            .field("requires", &self.requires)
            .finish()
    }
}

impl<A, E> Effect<A, E> {
    /// Wrap a raw node
    #[doc(hidden)]
    pub fn from_node(node: NodeRef, requires: Requirements) -> Self {
        Self {
            node,
            requires,
            _types: PhantomData,
        }
    }

    fn wrap(node: Node, requires: Requirements) -> Self {
        Self::from_node(Arc::new(node), requires)
    }

    /// Root of the erased tree
    #[doc(hidden)]
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Take the root of the erased tree
    #[doc(hidden)]
    pub fn into_node(self) -> NodeRef {
        self.node
    }

    /// Services this effect needs from its context
    pub fn requirements(&self) -> &Requirements {
        &self.requires
    }
}

/// One-shot completion handle passed to [`Effect::async_op`]
///
/// Consuming methods guarantee a single completion. Dropping the handle
/// without completing leaves the fiber suspended until it is interrupted.
pub struct Resume<A, E> {
    inner: RawResume,
    _types: PhantomData<fn(A, E)>,
}

impl<A: Send + 'static, E: Send + 'static> Resume<A, E> {
    /// Complete with a value
    pub fn succeed(self, value: A) {
        (self.inner)(Ok(boxed(value)))
    }

    /// Complete with a typed failure
    pub fn fail(self, error: E) {
        (self.inner)(Err(Cause::Fail(boxed(error))))
    }

    /// Complete with a defect
    pub fn die(self, defect: Defect) {
        (self.inner)(Err(Cause::Die(defect)))
    }

    /// Complete with a full exit
    pub fn complete(self, exit: Exit<A, E>) {
        (self.inner)(exit_into_raw(exit))
    }
}

impl<A, E> fmt::Debug for Resume<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resume(..)")
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A: Send + 'static, E: Send + 'static> Effect<A, E> {
    /// Succeed with `value` (cloned on every run)
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::wrap(Node::Succeed(Arc::new(move || boxed(value.clone()))), Requirements::none())
    }

    /// Fail with `error` (cloned on every run)
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::wrap(
            Node::Fail(Arc::new(move || Cause::Fail(boxed(error.clone())))),
            Requirements::none(),
        )
    }

    /// Die with a defect
    pub fn die(defect: Defect) -> Self {
        Self::from_node(Node::die(defect), Requirements::none())
    }

    /// Suspend a side-effecting thunk. A panic becomes a defect.
    pub fn sync<F>(thunk: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::wrap(Node::Sync(Arc::new(move || Ok(boxed(thunk())))), Requirements::none())
    }

    /// Suspend a fallible thunk, mapping its native error into `E`
    pub fn try_sync<X, F, C>(thunk: F, catch: C) -> Self
    where
        F: Fn() -> Result<A, X> + Send + Sync + 'static,
        C: Fn(X) -> E + Send + Sync + 'static,
    {
        Self::wrap(
            Node::Sync(Arc::new(move || match thunk() {
                Ok(a) => Ok(boxed(a)),
                Err(x) => Err(Cause::Fail(boxed(catch(x)))),
            })),
            Requirements::none(),
        )
    }

    /// Callback-based asynchronous operation
    ///
    /// `register` receives a one-shot [`Resume`]; it may complete it
    /// immediately or from any thread later. The optional [`Canceler`] runs
    /// if the fiber is interrupted before completion. Every native fault
    /// must be mapped to `E` (or a defect) by the caller.
    pub fn async_op<F>(register: F) -> Self
    where
        F: Fn(Resume<A, E>) -> Option<Canceler> + Send + Sync + 'static,
    {
        Self::wrap(
            Node::Async(Arc::new(move |inner| {
                register(Resume {
                    inner,
                    _types: PhantomData,
                })
            })),
            Requirements::none(),
        )
    }

    /// Run a blocking closure on a dedicated thread, suspending the fiber meanwhile
    ///
    /// Interruption abandons the thread's result; the closure itself runs to completion.
    pub fn try_blocking<X, F, C>(f: F, catch: C) -> Self
    where
        X: 'static,
        F: Fn() -> Result<A, X> + Send + Sync + 'static,
        C: Fn(X) -> E + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let catch = Arc::new(catch);
        Self::async_op(move |resume| {
            let f = Arc::clone(&f);
            let catch = Arc::clone(&catch);
            let slot = Arc::new(parking_lot::Mutex::new(Some(resume)));
            let thread_slot = Arc::clone(&slot);
            let spawned = std::thread::Builder::new()
                .name("effex-blocking".into())
                .spawn(move || {
                    let exit = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f())) {
                        Ok(Ok(a)) => Ok(a),
                        Ok(Err(x)) => Err(Cause::Fail(catch(x))),
                        Err(payload) => Err(Cause::Die(Defect::from_panic(payload))),
                    };
                    if let Some(resume) = thread_slot.lock().take() {
                        resume.complete(exit);
                    }
                });
            if let Err(e) = spawned {
                if let Some(resume) = slot.lock().take() {
                    resume.die(Defect::internal(format!("failed to spawn blocking thread: {}", e)));
                }
            }
            None
        })
    }

    /// Never completes; only interruption ends it
    pub fn never() -> Self {
        Self::wrap(Node::Async(Arc::new(|_resume| None)), Requirements::none())
    }

    /// Look up a service and continue with it
    pub fn with_service<S, F>(tag: &Tag<S>, f: F) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<S>) -> Effect<A, E> + Send + Sync + 'static,
    {
        Effect::<Arc<S>, E>::service(tag).flat_map(f)
    }
}

impl<S, E> Effect<Arc<S>, E>
where
    S: ?Sized + Send + Sync + 'static,
    E: Send + 'static,
{
    /// Look up a service in the context
    ///
    /// A missing service is a defect; the runtime's pre-flight check
    /// rejects programs whose declared requirements are unmet.
    pub fn service(tag: &Tag<S>) -> Self {
        let tag = *tag;
        Self::wrap(
            Node::AccessContext(Arc::new(move |ctx| match ctx.get(&tag) {
                Some(svc) => Node::value(boxed(svc)),
                None => Node::die(Defect::missing_service(tag.name())),
            })),
            Requirements::of(&tag),
        )
    }
}

impl<E: Send + 'static> Effect<Context, E> {
    /// Read the whole context
    pub fn context() -> Self {
        Self::wrap(
            Node::AccessContext(Arc::new(|ctx| Node::value(boxed(ctx.clone())))),
            Requirements::none(),
        )
    }
}

impl<E: Send + 'static> Effect<(), E> {
    /// Succeed with `()`
    pub fn unit() -> Self {
        Self::wrap(Node::Succeed(Arc::new(|| boxed(()))), Requirements::none())
    }

    /// Suspend the fiber for `duration` without holding a worker
    pub fn sleep(duration: Duration) -> Self {
        Self::wrap(Node::Sleep(duration), Requirements::none())
    }

    /// Let other fibers run
    pub fn yield_now() -> Self {
        Self::wrap(Node::Yield, Requirements::none())
    }

    /// Log at `INFO`
    pub fn log(message: impl Into<String>) -> Self {
        Self::log_at(Level::INFO, message)
    }

    /// Log at the given level, tagged with the fiber id and active spans
    pub fn log_at(level: Level, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::wrap(Node::Log(level, Arc::from(message)), Requirements::none())
    }
}

impl<E: Send + 'static> Effect<u64, E> {
    /// Wall-clock milliseconds since the Unix epoch, read when run
    pub fn current_time_millis() -> Self {
        Self::sync(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use raw::{cause_into_raw, downcast};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_construction_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let eff: Effect<usize> = Effect::sync(move || c.fetch_add(1, Ordering::SeqCst))
            .map(|n| n + 1)
            .flat_map(|n| Effect::succeed(n * 2))
            .ensuring(Effect::<(), Infallible>::unit());
        let _copy = eff.clone();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_service_adds_requirement() {
        let tag: Tag<String> = Tag::new("Name");
        let eff: Effect<Arc<String>> = Effect::service(&tag);
        assert_eq!(eff.requirements().names(), vec!["Name"]);

        let mapped = eff.map(|s| s.len());
        assert!(mapped.requirements().contains(tag.id()));
    }

    #[test]
    fn test_debug_shows_root() {
        let eff: Effect<u8> = Effect::succeed(1);
        assert!(format!("{:?}", eff).contains("Succeed"));
    }

    #[test]
    fn test_resume_passes_through() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = Arc::clone(&seen);
        let resume: Resume<u8, String> = Resume {
            inner: Box::new(move |exit| *s.lock() = Some(raw::exit_from_raw::<u8, String>(exit))),
            _types: PhantomData,
        };
        resume.fail("nope".into());
        assert_eq!(*seen.lock(), Some(Err(Cause::Fail("nope".to_string()))));
    }

    #[test]
    fn test_raw_thunks_are_rerunnable() {
        let eff: Effect<String, u8> = Effect::succeed("x".to_string());
        if let Node::Succeed(thunk) = &**eff.node() {
            let a = downcast::<String>(thunk()).ok();
            let b = downcast::<String>(thunk()).ok();
            assert_eq!(a, b);
        } else {
            panic!("expected Succeed node");
        }
    }

    #[test]
    fn test_fail_node_carries_typed_error() {
        let eff: Effect<(), String> = Effect::fail("bad".into());
        if let Node::Fail(thunk) = &**eff.node() {
            let cause: Cause<String> = raw::cause_from_raw(thunk());
            assert_eq!(cause, Cause::Fail("bad".into()));
        } else {
            panic!("expected Fail node");
        }
        let _ = cause_into_raw::<u8>(Cause::Interrupt);
    }
}

//! Erased effect tree
//!
//! `Effect<A, E>` is a typed view over a [`Node`] tree in which values and
//! failures travel as `Box<dyn Any + Send>`. The interpreter only ever sees
//! this representation; typed wrappers downcast at the edges.
//!
//! Closures are `Arc<dyn Fn>` rather than `FnOnce` because a tree may be
//! executed many times (a `Retry` re-runs its subtree, a layer may be
//! provided to several runs).

use std::any::{type_name, Any};
use std::mem;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::Level;

use crate::cause::{Cause, Defect, Exit};
use crate::context::Context;
use crate::layer::ProvidePlan;
use crate::schedule::RawSchedule;

use super::concurrency::AllOptions;

/// Erased success or failure payload
pub type Value = Box<dyn Any + Send>;

/// Erased cause
pub type RawCause = Cause<Value>;

/// Erased exit
pub type RawExit = Result<Value, RawCause>;

/// Shared reference to a node
pub type NodeRef = Arc<Node>;

/// One-shot completion callback handed to async registrations
pub type RawResume = Box<dyn FnOnce(RawExit) + Send>;

/// Cleanup run when an async operation is interrupted before completing
pub type Canceler = Box<dyn FnOnce() + Send>;

/// Re-runnable thunk
pub type Thunk<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Continuation from a settled value to the next node
pub type Cont = Arc<dyn Fn(Value) -> NodeRef + Send + Sync>;

/// Async registration
pub type Register = Arc<dyn Fn(RawResume) -> Option<Canceler> + Send + Sync>;

/// Context reader
pub type Reader = Arc<dyn Fn(&Context) -> NodeRef + Send + Sync>;

/// Effect tree node
pub enum Node {
    /// Produce a value
    Succeed(Thunk<Value>),

    /// Produce a cause
    Fail(Thunk<RawCause>),

    /// Run a side-effecting thunk
    Sync(Thunk<RawExit>),

    /// Precomputed exit, consumed by the single evaluation of a node built at run time
    Exit(Mutex<Option<RawExit>>),

    /// Suspend until the registered callback resumes
    Async(Register),

    /// Sequence: run the source, feed its value to the continuation
    FlatMap(NodeRef, Cont),

    /// Recover typed failures of the source (defects and interruption pass through)
    Catch(NodeRef, Cont),

    /// Run the finalizer after the source on every exit path
    Ensuring(NodeRef, NodeRef),

    /// Run the source with interruption deferred
    Uninterruptible(NodeRef),

    /// Build layers into the context, then run the source
    Provide(NodeRef, Arc<ProvidePlan>),

    /// First child to settle wins
    Race(Vec<NodeRef>),

    /// Run children with bounded concurrency, results in input order
    All(Vec<NodeRef>, AllOptions),

    /// Re-run the source on typed failure as the schedule allows
    Retry(NodeRef, RawSchedule),

    /// Suspend for a duration
    Sleep(Duration),

    /// Read the current context
    AccessContext(Reader),

    /// Start the source in a supervised child fiber
    Fork(NodeRef),

    /// Emit a log message tagged with the fiber and its spans
    Log(Level, Arc<str>),

    /// Run the source inside a named log span
    LogSpan(Arc<str>, NodeRef),

    /// Give up the worker
    Yield,
}

static PLACEHOLDER: LazyLock<NodeRef> = LazyLock::new(|| Arc::new(Node::Yield));

impl Node {
    /// Node yielding a precomputed exit once
    pub fn exit(exit: RawExit) -> NodeRef {
        Arc::new(Node::Exit(Mutex::new(Some(exit))))
    }

    /// Node yielding a precomputed value once
    pub fn value(value: Value) -> NodeRef {
        Self::exit(Ok(value))
    }

    /// Node failing with a precomputed cause once
    pub fn cause(cause: RawCause) -> NodeRef {
        Self::exit(Err(cause))
    }

    /// Node dying with a defect
    pub fn die(defect: Defect) -> NodeRef {
        Arc::new(Node::Fail(Arc::new(move || Cause::Die(defect.clone()))))
    }

    /// Variant name (tracing)
    pub fn name(&self) -> &'static str {
        match self {
            Node::Succeed(_) => "Succeed",
            Node::Fail(_) => "Fail",
            Node::Sync(_) => "Sync",
            Node::Exit(_) => "Exit",
            Node::Async(_) => "Async",
            Node::FlatMap(..) => "FlatMap",
            Node::Catch(..) => "Catch",
            Node::Ensuring(..) => "Ensuring",
            Node::Uninterruptible(_) => "Uninterruptible",
            Node::Provide(..) => "Provide",
            Node::Race(_) => "Race",
            Node::All(..) => "All",
            Node::Retry(..) => "Retry",
            Node::Sleep(_) => "Sleep",
            Node::AccessContext(_) => "AccessContext",
            Node::Fork(_) => "Fork",
            Node::Log(..) => "Log",
            Node::LogSpan(..) => "LogSpan",
            Node::Yield => "Yield",
        }
    }

    /// Statically visible children (not continuation results)
    pub fn children(&self) -> Vec<&NodeRef> {
        match self {
            Node::FlatMap(src, _)
            | Node::Catch(src, _)
            | Node::Uninterruptible(src)
            | Node::Provide(src, _)
            | Node::Retry(src, _)
            | Node::Fork(src)
            | Node::LogSpan(_, src) => vec![src],
            Node::Ensuring(src, fin) => vec![src, fin],
            Node::Race(children) | Node::All(children, _) => children.iter().collect(),
            _ => Vec::new(),
        }
    }

    fn take_children(&mut self, out: &mut Vec<NodeRef>) {
        match self {
            Node::FlatMap(src, _)
            | Node::Catch(src, _)
            | Node::Uninterruptible(src)
            | Node::Provide(src, _)
            | Node::Retry(src, _)
            | Node::Fork(src)
            | Node::LogSpan(_, src) => out.push(mem::replace(src, PLACEHOLDER.clone())),
            Node::Ensuring(src, fin) => {
                out.push(mem::replace(src, PLACEHOLDER.clone()));
                out.push(mem::replace(fin, PLACEHOLDER.clone()));
            }
            Node::Race(children) | Node::All(children, _) => out.append(children),
            _ => {}
        }
    }
}

// Long left-nested chains would otherwise drop recursively, one stack frame
// set per level.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_children(&mut pending);
        while let Some(child) = pending.pop() {
            if let Ok(mut node) = Arc::try_unwrap(child) {
                node.take_children(&mut pending);
            }
        }
    }
}

/// Box a value for the erased tree
#[inline]
pub fn boxed<T: Send + 'static>(value: T) -> Value {
    Box::new(value)
}

/// Recover a typed value from the erased tree
pub fn downcast<T: 'static>(value: Value) -> Result<T, Defect> {
    value
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| Defect::internal(format!("type mismatch: expected {}", type_name::<T>())))
}

/// Erase a typed cause
pub fn cause_into_raw<E: Send + 'static>(cause: Cause<E>) -> RawCause {
    cause.map(boxed)
}

/// Recover a typed cause; a mistyped failure becomes an internal defect
pub fn cause_from_raw<E: 'static>(cause: RawCause) -> Cause<E> {
    match cause {
        Cause::Fail(v) => match downcast::<E>(v) {
            Ok(e) => Cause::Fail(e),
            Err(d) => Cause::Die(d),
        },
        Cause::Die(d) => Cause::Die(d),
        Cause::Interrupt => Cause::Interrupt,
    }
}

/// Recover a typed exit
pub fn exit_from_raw<A: 'static, E: 'static>(exit: RawExit) -> Exit<A, E> {
    match exit {
        Ok(v) => downcast::<A>(v).map_err(Cause::Die),
        Err(c) => Err(cause_from_raw(c)),
    }
}

/// Erase a typed exit
pub fn exit_into_raw<A: Send + 'static, E: Send + 'static>(exit: Exit<A, E>) -> RawExit {
    exit.map(boxed).map_err(cause_into_raw)
}

/// Continuation that yields `value` on its single call
pub(crate) fn once_value(value: Value) -> Cont {
    let slot = Mutex::new(Some(value));
    Arc::new(move |_| match slot.lock().take() {
        Some(v) => Node::value(v),
        None => Node::die(Defect::internal("one-shot continuation resumed twice")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast() {
        assert_eq!(downcast::<u32>(boxed(5u32)), Ok(5));
        let err = downcast::<String>(boxed(5u32)).unwrap_err();
        assert!(err.message().contains("String"));
    }

    #[test]
    fn test_exit_conversion() {
        let raw = exit_into_raw::<u32, String>(Err(Cause::Fail("no".into())));
        let back: Exit<u32, String> = exit_from_raw(raw);
        assert_eq!(back, Err(Cause::Fail("no".to_string())));

        let mistyped: Exit<u32, u8> = exit_from_raw(Err(Cause::Fail(boxed("str"))));
        assert!(matches!(mistyped, Err(Cause::Die(_))));
    }

    #[test]
    fn test_deep_left_chain_drops_iteratively() {
        let mut node: NodeRef = Arc::new(Node::Yield);
        for _ in 0..200_000 {
            node = Arc::new(Node::FlatMap(node, Arc::new(|v| Node::value(v))));
        }
        drop(node);
    }

    #[test]
    fn test_once_value() {
        let k = once_value(boxed(1u8));
        assert!(matches!(&*k(boxed(())), Node::Exit(_)));
        assert!(matches!(&*k(boxed(())), Node::Fail(_)));
    }
}

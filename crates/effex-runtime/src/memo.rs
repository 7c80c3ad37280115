//! Per-run layer memo
//!
//! Every fiber of one `Runtime::run` shares a [`RunScope`]. A layer node is
//! built at most once per scope: the first fiber to reach it claims it and
//! builds; fibers arriving meanwhile wait for the outcome; later ones reuse
//! the stored context.
//!
//! Only successes are stored. A failed build hands its cause to the fibers
//! waiting on it and is then forgotten, so a retried `provide` builds again.
//! An interrupted build is forgotten the same way and its waiters look again.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use effex_core::effect::raw::{boxed, Node, NodeRef, RawCause, RawExit};
use effex_core::layer::LayerNode;
use effex_core::{Context, FiberId, LayerId};

/// Woken when a build ends: with its failure, or `None` to look again
type Waiter = Box<dyn FnOnce(Option<RawCause>) + Send>;

enum MemoEntry {
    Building { owner: FiberId, waiters: Vec<Waiter> },
    Built(Context),
}

/// Outcome of a memo lookup
pub(crate) enum Lookup {
    /// Already built
    Built(Context),

    /// The caller now owns the build and must `complete`, `fail` or `abandon` it
    Claimed,

    /// Another fiber is building; `wait` for it
    Busy,
}

/// Memo map shared by all fibers of one run
pub(crate) struct RunScope {
    memo: Mutex<HashMap<LayerId, MemoEntry>>,
}

impl RunScope {
    pub(crate) fn new() -> Self {
        Self {
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lookup_or_claim(&self, layer: &LayerNode, fiber: FiberId) -> Lookup {
        let mut memo = self.memo.lock();
        match memo.get(&layer.id()) {
            Some(MemoEntry::Built(ctx)) => Lookup::Built(ctx.clone()),
            Some(MemoEntry::Building { .. }) => Lookup::Busy,
            None => {
                memo.insert(
                    layer.id(),
                    MemoEntry::Building {
                        owner: fiber,
                        waiters: Vec::new(),
                    },
                );
                debug!(layer = layer.name(), fiber = %fiber, "building layer");
                Lookup::Claimed
            }
        }
    }

    /// Run `waiter` once the in-flight build of `id` ends (now if it has)
    pub(crate) fn wait(&self, id: LayerId, waiter: Waiter) {
        let run_now = {
            let mut memo = self.memo.lock();
            match memo.get_mut(&id) {
                Some(MemoEntry::Building { waiters, .. }) => {
                    waiters.push(waiter);
                    None
                }
                _ => Some(waiter),
            }
        };
        if let Some(waiter) = run_now {
            waiter(None);
        }
    }

    /// Store a built context and wake waiters
    pub(crate) fn complete(&self, layer: &LayerNode, ctx: Context) {
        let waiters = {
            let mut memo = self.memo.lock();
            match memo.insert(layer.id(), MemoEntry::Built(ctx)) {
                Some(MemoEntry::Building { waiters, .. }) => waiters,
                _ => Vec::new(),
            }
        };
        debug!(layer = layer.name(), waiters = waiters.len(), "layer built");
        for waiter in waiters {
            waiter(None);
        }
    }

    /// Hand a build failure to the waiters, then forget the build
    pub(crate) fn fail(&self, layer: &LayerNode, cause: &RawCause) {
        for waiter in self.take_building(layer, "failed") {
            waiter(Some(layer.clone_cause(cause)));
        }
    }

    /// Forget an interrupted build; waiters retry the lookup
    pub(crate) fn abandon(&self, layer: &LayerNode) {
        for waiter in self.take_building(layer, "abandoned") {
            waiter(None);
        }
    }

    /// Remove an in-flight entry, returning its waiters
    fn take_building(&self, layer: &LayerNode, outcome: &'static str) -> Vec<Waiter> {
        let mut memo = self.memo.lock();
        match memo.remove(&layer.id()) {
            Some(MemoEntry::Building { owner, waiters }) => {
                debug!(layer = layer.name(), fiber = %owner, waiters = waiters.len(), outcome, "layer build forgotten");
                waiters
            }
            Some(built) => {
                memo.insert(layer.id(), built);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.memo.lock().len()
    }
}

/// Node that suspends until the build of `id` in `scope` ends
///
/// Completes with `()` (the waiting fiber then repeats its lookup) or
/// fails with the cause of a failed build.
pub(crate) fn wait_node(scope: &Arc<RunScope>, id: LayerId) -> NodeRef {
    let scope = Arc::clone(scope);
    Arc::new(Node::Async(Arc::new(move |resume| {
        let resume = Mutex::new(Some(resume));
        scope.wait(
            id,
            Box::new(move |failure: Option<RawCause>| {
                if let Some(resume) = mem::take(&mut *resume.lock()) {
                    let exit: RawExit = match failure {
                        Some(cause) => Err(cause),
                        None => Ok(boxed(())),
                    };
                    resume(exit);
                }
            }),
        );
        None
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use effex_core::{Cause, Defect, Layer, Tag};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer() -> Arc<LayerNode> {
        let tag: Tag<u32> = Tag::new("Num");
        let layer: Layer<Infallible> = Layer::succeed(&tag, Arc::new(1));
        Arc::clone(&layer.nodes()[0])
    }

    #[test]
    fn test_claim_then_busy_then_built() {
        let scope = RunScope::new();
        let node = layer();
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Claimed));
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Busy));

        let woken = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&woken);
        scope.wait(node.id(), Box::new(move |failure| {
            assert!(failure.is_none());
            w.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        scope.complete(&node, Context::empty());
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Built(_)));
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_abandon_allows_rebuild() {
        let scope = RunScope::new();
        let node = layer();
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Claimed));
        scope.abandon(&node);
        assert_eq!(scope.len(), 0);
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Claimed));
    }

    #[test]
    fn test_failure_reaches_waiters_and_is_forgotten() {
        let scope = RunScope::new();
        let node = layer();
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Claimed));

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        scope.wait(node.id(), Box::new(move |failure| {
            *s.lock() = failure;
        }));

        scope.fail(&node, &Cause::Die(Defect::custom("no config")));
        assert!(matches!(seen.lock().take(), Some(Cause::Die(_))));
        assert_eq!(scope.len(), 0);
        assert!(matches!(scope.lookup_or_claim(&node, FiberId::next()), Lookup::Claimed));
    }

    #[test]
    fn test_wait_after_build_runs_immediately() {
        let scope = RunScope::new();
        let node = layer();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        scope.wait(node.id(), Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

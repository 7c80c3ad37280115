//! Shared mutable cells
//!
//! A [`Ref`] is the only sanctioned way for fibers to share mutable state.
//! Every operation is a single effect step under one lock, so `modify` and
//! `update` are atomic with respect to other fibers.

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;

/// Mutable cell shared between fibers
pub struct Ref<T> {
    cell: Arc<Mutex<T>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.cell.lock()).finish()
    }
}

impl<T: Send + 'static> Ref<T> {
    /// Effect allocating a fresh cell each time it runs
    pub fn make<E: Send + 'static>(initial: T) -> Effect<Ref<T>, E>
    where
        T: Clone + Sync,
    {
        Effect::sync(move || Ref::unsafe_make(initial.clone()))
    }

    /// Allocate a cell outside of any effect
    pub fn unsafe_make(initial: T) -> Self {
        Self {
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// Read the current value
    pub fn get<E: Send + 'static>(&self) -> Effect<T, E>
    where
        T: Clone,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || cell.lock().clone())
    }

    /// Replace the value
    pub fn set<E: Send + 'static>(&self, value: T) -> Effect<(), E>
    where
        T: Clone + Sync,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || *cell.lock() = value.clone())
    }

    /// Replace the value, returning the previous one
    pub fn get_and_set<E: Send + 'static>(&self, value: T) -> Effect<T, E>
    where
        T: Clone + Sync,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || std::mem::replace(&mut *cell.lock(), value.clone()))
    }

    /// Apply `f` atomically
    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: Send + 'static,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || {
            let mut guard = cell.lock();
            *guard = f(&guard);
        })
    }

    /// Apply `f` atomically and return the new value
    pub fn update_and_get<E, F>(&self, f: F) -> Effect<T, E>
    where
        T: Clone,
        E: Send + 'static,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || {
            let mut guard = cell.lock();
            *guard = f(&guard);
            guard.clone()
        })
    }

    /// Compute a result and a new value from the current one, atomically
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        E: Send + 'static,
        F: Fn(&T) -> (B, T) + Send + Sync + 'static,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || {
            let mut guard = cell.lock();
            let (out, next) = f(&guard);
            *guard = next;
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::raw::{downcast, Node};
    use std::convert::Infallible;

    fn run_sync<A: 'static, E>(eff: Effect<A, E>) -> A {
        match &**eff.node() {
            Node::Sync(thunk) => match thunk() {
                Ok(v) => downcast::<A>(v).unwrap(),
                Err(_) => panic!("sync step failed"),
            },
            other => panic!("expected Sync node, got {}", other.name()),
        }
    }

    #[test]
    fn test_ref_ops_are_single_steps() {
        let r = Ref::unsafe_make(10u32);
        run_sync(r.update::<Infallible, _>(|n| n + 1));
        assert_eq!(run_sync(r.get::<Infallible>()), 11);

        let doubled = run_sync(r.update_and_get::<Infallible, _>(|n| n * 2));
        assert_eq!(doubled, 22);

        let old = run_sync(r.get_and_set::<Infallible>(5));
        assert_eq!(old, 22);

        let label = run_sync(r.modify::<_, Infallible, _>(|n| (format!("was {}", n), n + 100)));
        assert_eq!(label, "was 5");
        assert_eq!(run_sync(r.get::<Infallible>()), 105);

        run_sync(r.set::<Infallible>(0));
        assert_eq!(format!("{:?}", r), "Ref(0)");
    }

    #[test]
    fn test_make_allocates_per_run() {
        let eff: Effect<Ref<u8>> = Ref::make(1);
        let a = run_sync(eff.clone());
        let b = run_sync(eff);
        run_sync(a.set::<Infallible>(9));
        assert_eq!(run_sync(b.get::<Infallible>()), 1);
    }

    #[test]
    fn test_clones_share_the_cell() {
        let r = Ref::unsafe_make(vec![1]);
        let r2 = r.clone();
        run_sync(r2.update::<Infallible, _>(|v| {
            let mut v = v.clone();
            v.push(2);
            v
        }));
        assert_eq!(run_sync(r.get::<Infallible>()), vec![1, 2]);
    }
}

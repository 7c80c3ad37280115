//! Service tags, the immutable service context and requirement sets
//!
//! A [`Tag`] names a capability. A [`Context`] maps tags to service
//! instances; it is never mutated in place, `with`/`merge` return a new map
//! sharing the untouched entries. [`Requirements`] is the set of tags an
//! effect still needs before it can run.

use core::fmt;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::id::TagId;

/// Process-unique key for a service of type `S`
///
/// `S` may be unsized, so trait-object services work:
///
/// ```ignore
/// static DB: LazyLock<Tag<dyn Db>> = LazyLock::new(|| Tag::new("Db"));
/// ```
pub struct Tag<S: ?Sized> {
    id: TagId,
    name: &'static str,
    _service: PhantomData<fn() -> Arc<S>>,
}

impl<S: ?Sized> Tag<S> {
    /// Create a fresh tag. Two calls with the same name yield distinct tags.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: TagId::next(),
            name,
            _service: PhantomData,
        }
    }

    /// Tag id
    #[inline]
    pub fn id(&self) -> TagId {
        self.id
    }

    /// Tag name (diagnostics only)
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<S: ?Sized> Clone for Tag<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ?Sized> Copy for Tag<S> {}

impl<S: ?Sized> PartialEq for Tag<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S: ?Sized> Eq for Tag<S> {}

impl<S: ?Sized> fmt::Debug for Tag<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({}{})", self.name, self.id)
    }
}

/// One entry of a context. The payload is an `Arc<S>` boxed as `Any`.
#[derive(Clone)]
struct Entry {
    name: &'static str,
    service: Arc<dyn Any + Send + Sync>,
}

/// Immutable map from tags to services
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<HashMap<TagId, Entry>>,
}

impl Context {
    /// Empty context
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a service
    pub fn get<S>(&self, tag: &Tag<S>) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .get(&tag.id)
            .and_then(|e| e.service.downcast_ref::<Arc<S>>())
            .cloned()
    }

    /// Check for a tag without knowing its service type
    pub fn contains(&self, id: TagId) -> bool {
        self.entries.contains_key(&id)
    }

    /// A new context with `tag` bound to `service`
    pub fn with<S>(&self, tag: &Tag<S>, service: Arc<S>) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let mut entries = (*self.entries).clone();
        entries.insert(
            tag.id,
            Entry {
                name: tag.name,
                service: Arc::new(service),
            },
        );
        Self {
            entries: Arc::new(entries),
        }
    }

    /// A new context holding both; entries of `other` win on conflict
    pub fn merge(&self, other: &Context) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut entries = (*self.entries).clone();
        for (id, entry) in other.entries.iter() {
            entries.insert(*id, entry.clone());
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// A new context keeping only the given tags
    pub fn restrict<'a>(&self, keep: impl IntoIterator<Item = &'a TagId>) -> Self {
        let entries = keep
            .into_iter()
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e.clone())))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no services
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("Context").field("services", &names).finish()
    }
}

/// Set of tags an effect needs from its context
///
/// Ordered by tag id so diagnostics are stable.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    tags: BTreeMap<TagId, &'static str>,
}

impl Requirements {
    /// No requirements
    pub fn none() -> Self {
        Self::default()
    }

    /// Requirements of a single tag
    pub fn of<S: ?Sized>(tag: &Tag<S>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(tag.id, tag.name);
        Self { tags }
    }

    /// Add one tag
    pub fn insert(&mut self, id: TagId, name: &'static str) {
        self.tags.insert(id, name);
    }

    /// Union with another set
    pub fn union(mut self, other: &Requirements) -> Self {
        if self.tags.is_empty() {
            return other.clone();
        }
        for (id, name) in &other.tags {
            self.tags.insert(*id, name);
        }
        self
    }

    /// Remove the given tags
    pub fn without<'a>(mut self, ids: impl IntoIterator<Item = &'a TagId>) -> Self {
        for id in ids {
            self.tags.remove(id);
        }
        self
    }

    /// Check membership
    pub fn contains(&self, id: TagId) -> bool {
        self.tags.contains_key(&id)
    }

    /// Tags still needed by `self` that `context` lacks
    pub fn missing_from(&self, context: &Context) -> Vec<&'static str> {
        self.tags
            .iter()
            .filter(|(id, _)| !context.contains(**id))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Tag ids
    pub fn ids(&self) -> impl Iterator<Item = &TagId> {
        self.tags.keys()
    }

    /// `(id, name)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (TagId, &'static str)> + '_ {
        self.tags.iter().map(|(id, name)| (*id, *name))
    }

    /// Tag names, in id order
    pub fn names(&self) -> Vec<&'static str> {
        self.tags.values().copied().collect()
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Check if nothing is required
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl fmt::Debug for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tags.values()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    #[test]
    fn test_tags_are_unique() {
        let a: Tag<u32> = Tag::new("Counter");
        let b: Tag<u32> = Tag::new("Counter");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_context_get_and_with() {
        let num: Tag<u32> = Tag::new("Num");
        let ctx = Context::empty();
        assert!(ctx.get(&num).is_none());

        let ctx2 = ctx.with(&num, Arc::new(7));
        assert_eq!(ctx2.get(&num).as_deref(), Some(&7));
        // the original is untouched
        assert!(ctx.get(&num).is_none());
    }

    #[test]
    fn test_trait_object_service() {
        let greeter: Tag<dyn Greeter> = Tag::new("Greeter");
        let svc: Arc<dyn Greeter> = Arc::new(English);
        let ctx = Context::empty().with(&greeter, svc);
        let found = ctx.get(&greeter).map(|g| g.greet());
        assert_eq!(found.as_deref(), Some("hello"));
    }

    #[test]
    fn test_merge_and_restrict() {
        let a: Tag<u32> = Tag::new("A");
        let b: Tag<u32> = Tag::new("B");
        let left = Context::empty().with(&a, Arc::new(1)).with(&b, Arc::new(2));
        let right = Context::empty().with(&b, Arc::new(20));

        let merged = left.merge(&right);
        assert_eq!(merged.get(&b).as_deref(), Some(&20));
        assert_eq!(merged.len(), 2);

        let only_a = merged.restrict([&a.id()]);
        assert_eq!(only_a.len(), 1);
        assert!(only_a.get(&b).is_none());
    }

    #[test]
    fn test_requirements_algebra() {
        let a: Tag<u32> = Tag::new("A");
        let b: Tag<String> = Tag::new("B");
        let reqs = Requirements::of(&a).union(&Requirements::of(&b));
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs.names(), vec!["A", "B"]);

        let ctx = Context::empty().with(&a, Arc::new(1));
        assert_eq!(reqs.missing_from(&ctx), vec!["B"]);

        let reduced = reqs.without([&b.id()]);
        assert!(reduced.contains(a.id()));
        assert!(!reduced.contains(b.id()));
    }
}

//! Layers: recipes that build services from other services
//!
//! A [`Layer`] is a small graph of atomic [`LayerNode`]s plus the set of
//! tags it exports. Composition only rearranges nodes; nothing is built
//! until the interpreter evaluates a `Provide` node.
//!
//! ```text
//!   config ──► db ──► users          users.provide(db.provide(config))
//!                 └─► posts          exports: users only
//! ```
//!
//! # Planning
//!
//! [`Layer::plan`] orders the atomic nodes so every node runs after the
//! nodes producing its inputs (Kahn's algorithm; ties broken by insertion
//! order so plans are deterministic). Inputs that no node produces come
//! from the surrounding context. A cycle, or two distinct nodes producing
//! the same tag, is a [`LayerError`].
//!
//! # Identity
//!
//! Each atomic node gets a [`LayerId`] when created. Cloning or merging a
//! layer keeps the ids, so the per-run memo map builds a shared dependency
//! once no matter how many branches reach it. `map_error` creates new
//! nodes with new ids.

use core::fmt;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::context::{Context, Requirements, Tag};
use crate::effect::raw::{boxed, downcast, Node, NodeRef, RawCause, Value};
use crate::effect::Effect;
use crate::error::{LayerError, LayerResult};
use crate::id::{LayerId, TagId};

type FailureCloner = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// One constructor in a layer graph
pub struct LayerNode {
    id: LayerId,
    name: String,
    outputs: Requirements,
    inputs: Requirements,
    build: NodeRef,
    clone_failure: FailureCloner,
}

impl LayerNode {
    /// Memo key
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags this node produces
    pub fn outputs(&self) -> &Requirements {
        &self.outputs
    }

    /// Tags this node consumes
    pub fn inputs(&self) -> &Requirements {
        &self.inputs
    }

    /// Constructor; evaluates to a `Context` holding the outputs
    pub fn build(&self) -> &NodeRef {
        &self.build
    }

    /// Copy a build failure so the memo map can hand it to every requester
    pub fn clone_cause(&self, cause: &RawCause) -> RawCause {
        match cause {
            Cause::Fail(v) => match (self.clone_failure)(v) {
                Some(copy) => Cause::Fail(copy),
                None => Cause::Die(Defect::internal(format!(
                    "layer {} failed with an uncloneable error",
                    self.name
                ))),
            },
            Cause::Die(d) => Cause::Die(d.clone()),
            Cause::Interrupt => Cause::Interrupt,
        }
    }
}

impl fmt::Debug for LayerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("outputs", &self.outputs)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// What a `Provide` node carries: the planned build order and the exports
#[derive(Debug)]
pub struct ProvidePlan {
    layers: LayerResult<Vec<Arc<LayerNode>>>,
    exports: Vec<TagId>,
}

impl ProvidePlan {
    /// Build order, or the planning error
    pub fn layers(&self) -> Result<&[Arc<LayerNode>], &LayerError> {
        self.layers.as_deref()
    }

    /// Tags visible to the provided effect
    pub fn exports(&self) -> &[TagId] {
        &self.exports
    }
}

/// Recipe producing services, failing with `E`
pub struct Layer<E> {
    nodes: Vec<Arc<LayerNode>>,
    exports: Requirements,
    _error: PhantomData<fn() -> E>,
}

impl<E> Clone for Layer<E> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            exports: self.exports.clone(),
            _error: PhantomData,
        }
    }
}

impl<E> fmt::Debug for Layer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("nodes", &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("exports", &self.exports)
            .finish()
    }
}

impl<E: Clone + Send + 'static> Layer<E> {
    fn atomic(name: String, outputs: Requirements, inputs: Requirements, build: NodeRef) -> Self {
        let node = LayerNode {
            id: LayerId::next(),
            name,
            outputs: outputs.clone(),
            inputs,
            build,
            clone_failure: Arc::new(|v: &Value| v.downcast_ref::<E>().map(|e| boxed(e.clone()))),
        };
        Self {
            nodes: vec![Arc::new(node)],
            exports: outputs,
            _error: PhantomData,
        }
    }

    /// Layer providing an already constructed service
    pub fn succeed<S>(tag: &Tag<S>, service: Arc<S>) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let tag = *tag;
        let build = Arc::new(Node::Succeed(Arc::new(move || {
            boxed(Context::empty().with(&tag, Arc::clone(&service)))
        })));
        Self::atomic(
            format!("Layer({})", tag.name()),
            Requirements::of(&tag),
            Requirements::none(),
            build,
        )
    }

    /// Layer constructing a service with an effect
    ///
    /// The effect's requirements become the layer's inputs.
    pub fn effect<S>(tag: &Tag<S>, effect: Effect<Arc<S>, E>) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let tag = *tag;
        let inputs = effect.requirements().clone();
        let build = Arc::new(Node::FlatMap(
            effect.into_node(),
            Arc::new(move |v| match downcast::<Arc<S>>(v) {
                Ok(service) => Node::value(boxed(Context::empty().with(&tag, service))),
                Err(d) => Node::die(d),
            }),
        ));
        Self::atomic(format!("Layer({})", tag.name()), Requirements::of(&tag), inputs, build)
    }

    /// Rename an atomic layer (diagnostics only); composite layers are returned unchanged
    pub fn named(self, name: impl Into<String>) -> Self {
        if self.nodes.len() != 1 {
            return self;
        }
        let node = &self.nodes[0];
        let renamed = LayerNode {
            id: node.id,
            name: name.into(),
            outputs: node.outputs.clone(),
            inputs: node.inputs.clone(),
            build: Arc::clone(&node.build),
            clone_failure: Arc::clone(&node.clone_failure),
        };
        Self {
            nodes: vec![Arc::new(renamed)],
            exports: self.exports,
            _error: PhantomData,
        }
    }

    /// Both layers side by side; exports are the union
    pub fn merge(&self, other: &Layer<E>) -> Self {
        Self {
            nodes: union_nodes(&self.nodes, &other.nodes),
            exports: self.exports.clone().union(&other.exports),
            _error: PhantomData,
        }
    }

    /// Feed `dependency` into `self`; only `self`'s exports stay visible
    pub fn provide(&self, dependency: &Layer<E>) -> Self {
        Self {
            nodes: union_nodes(&dependency.nodes, &self.nodes),
            exports: self.exports.clone(),
            _error: PhantomData,
        }
    }

    /// Feed `dependency` into `self` and export both
    pub fn provide_merge(&self, dependency: &Layer<E>) -> Self {
        Self {
            nodes: union_nodes(&dependency.nodes, &self.nodes),
            exports: self.exports.clone().union(&dependency.exports),
            _error: PhantomData,
        }
    }

    /// Transform build failures; the result has fresh layer identities
    pub fn map_error<E2, F>(&self, f: F) -> Layer<E2>
    where
        E2: Clone + Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let f = Arc::clone(&f);
                let build = Arc::new(Node::Catch(
                    Arc::clone(&node.build),
                    Arc::new(move |v| match downcast::<E>(v) {
                        Ok(e) => Node::cause(Cause::Fail(boxed(f(e)))),
                        Err(d) => Node::die(d),
                    }),
                ));
                Arc::new(LayerNode {
                    id: LayerId::next(),
                    name: node.name.clone(),
                    outputs: node.outputs.clone(),
                    inputs: node.inputs.clone(),
                    build,
                    clone_failure: Arc::new(|v: &Value| v.downcast_ref::<E2>().map(|e| boxed(e.clone()))),
                })
            })
            .collect();
        Layer {
            nodes,
            exports: self.exports.clone(),
            _error: PhantomData,
        }
    }
}

impl<E> Layer<E> {
    /// Tags visible to an effect this layer is provided to
    pub fn exports(&self) -> &Requirements {
        &self.exports
    }

    /// Inputs no node in the graph produces
    pub fn requirements(&self) -> Requirements {
        let produced: Vec<TagId> = self
            .nodes
            .iter()
            .flat_map(|n| n.outputs.ids().copied().collect::<Vec<_>>())
            .collect();
        self.nodes
            .iter()
            .fold(Requirements::none(), |acc, n| acc.union(&n.inputs))
            .without(produced.iter())
    }

    /// Atomic nodes, in composition order
    pub fn nodes(&self) -> &[Arc<LayerNode>] {
        &self.nodes
    }

    /// Order the graph for construction
    pub fn plan(&self) -> LayerResult<Vec<Arc<LayerNode>>> {
        let nodes = &self.nodes;

        let mut provider: HashMap<TagId, usize> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for (id, name) in node.outputs.iter() {
                if let Some(&j) = provider.get(&id) {
                    return Err(LayerError::DuplicateService {
                        service: name,
                        first: nodes[j].name.clone(),
                        second: node.name.clone(),
                    });
                }
                provider.insert(id, i);
            }
        }

        let mut indegree = vec![0usize; nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let deps: BTreeSet<usize> = node.inputs.ids().filter_map(|id| provider.get(id).copied()).collect();
            for p in deps {
                indegree[i] += 1;
                dependents[p].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(Arc::clone(&nodes[i]));
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < nodes.len() {
            let layers = (0..nodes.len())
                .filter(|i| indegree[*i] > 0)
                .map(|i| nodes[i].name.clone())
                .collect();
            return Err(LayerError::Cycle { layers });
        }
        Ok(order)
    }

    /// Plan plus exports, as embedded in a `Provide` node
    pub fn provide_plan(&self) -> ProvidePlan {
        ProvidePlan {
            layers: self.plan(),
            exports: self.exports.ids().copied().collect(),
        }
    }
}

fn union_nodes(first: &[Arc<LayerNode>], second: &[Arc<LayerNode>]) -> Vec<Arc<LayerNode>> {
    let mut seen = BTreeSet::new();
    first
        .iter()
        .chain(second.iter())
        .filter(|n| seen.insert(n.id))
        .cloned()
        .collect()
}

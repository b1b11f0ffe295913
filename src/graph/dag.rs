//! dag.rs
//! The `Pipeline`: graph construction plus memoized evaluation.

use super::node::{FnOperator, NodeHandle, Operator};
use crate::analysis::topology::{self, CycleError};
use crate::compute::{ComputeError, Engine, EvalOptions, EvalReport, Ledger, NodeState, PipelineError};
use crate::store::{NodeId, NodeMetadata, Registry, TypeTag, Value};
use petgraph::dot::Dot;
use petgraph::graph::DiGraph;
use std::fmt;
use std::marker::PhantomData;

/// A graph of computation nodes together with their cached outputs.
///
/// Nodes are added with [`Pipeline::add_node`] and wired with the chainable
/// [`Pipeline::node`] builder. Evaluating a node computes only what is dirty
/// in its upstream closure; everything else is served from the cache.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub(crate) registry: Registry,
    pub(crate) ledger: Ledger,
}

impl Pipeline {
    pub fn new() -> Self { Self::default() }

    pub fn node_count(&self) -> usize { self.registry.count() }

    pub fn contains(&self, id: impl Into<NodeId>) -> bool {
        self.registry.contains(id.into())
    }

    // --- Construction ---

    /// Adds a node with no inputs, not yet calculated.
    pub fn add_node<Op: Operator>(&mut self, name: impl Into<String>, op: Op) -> NodeHandle<Op::Input, Op::Output> {
        let id = self.registry.add_node(Box::new(op), NodeMetadata::named(name));
        self.ledger.ensure_capacity(self.registry.count());
        NodeHandle::new(id)
    }

    /// Adds a node whose compute step is a closure.
    pub fn add_fn<I, O, F>(&mut self, name: impl Into<String>, f: F) -> NodeHandle<I, O>
    where
        I: Clone + fmt::Debug + Send + Sync + 'static,
        O: Clone + fmt::Debug + Send + Sync + 'static,
        F: Fn(&[I]) -> Result<O, ComputeError> + Send + Sync + 'static,
    {
        self.add_node(name, FnOperator::new(f))
    }

    /// Starts a chain of attachments to `handle`.
    ///
    /// ```
    /// # use pipeline_core::Pipeline;
    /// let mut p = Pipeline::new();
    /// let f1 = p.add_fn("f1", |xs: &[String]| Ok(xs.concat()));
    /// let f2 = p.add_fn("f2", |xs: &[String]| Ok(xs.concat()));
    /// p.node(&f1).literal("a").literal("b");
    /// p.node(&f2).upstream(f1).literal("c");
    /// assert_eq!(p.evaluate(&f2).unwrap(), "abc");
    /// ```
    ///
    /// # Panics
    /// If `handle` was created by another pipeline.
    pub fn node<I, O>(&mut self, handle: &NodeHandle<I, O>) -> Attach<'_, I> {
        let id = handle.id();
        assert!(self.registry.contains(id), "node {} does not belong to this pipeline", id);
        Attach { pipeline: self, id, _input: PhantomData }
    }

    /// Allows outputs of type `A` to feed nodes consuming `B`.
    pub fn allow_conversion<A, B>(&mut self) -> &mut Self
    where
        A: std::any::Any + Clone + Send + Sync,
        B: From<A> + std::any::Any + Send + Sync,
    {
        self.registry.rules.allow::<A, B>();
        self
    }

    pub fn set_display(&mut self, id: impl Into<NodeId>, enabled: bool) {
        let id = id.into();
        if let Some(meta) = self.registry.meta.get_mut(id.index()) {
            meta.display_output = enabled;
        }
    }

    /// Marks `id` and every node downstream of it as dirty.
    pub fn invalidate(&mut self, id: impl Into<NodeId>) {
        let id = id.into();
        if !self.registry.contains(id) {
            return;
        }
        let stale = topology::downstream_from(&self.registry, &[id]);
        self.ledger.invalidate(stale);
    }

    // --- Validation ---

    pub fn validate(&self, root: impl Into<NodeId>) -> Result<(), CycleError> {
        topology::validate(&self.registry, root.into())
    }

    pub fn validate_all(&self) -> Result<(), CycleError> {
        topology::validate_all(&self.registry)
    }

    /// Checks every upstream connection reachable from `root` against the
    /// connection rules, using declared types only. Nothing is computed.
    pub fn check_connections(&self, root: impl Into<NodeId>) -> Result<(), PipelineError> {
        let root = root.into();
        if !self.registry.contains(root) {
            return Err(PipelineError::UnknownNode(root));
        }
        for node in topology::dependency_order(&self.registry, root, |_| false)? {
            let expected = self.registry.operator(node).input_tag();
            for upstream in self.registry.get_upstream(node) {
                let found = self.registry.operator(upstream).output_tag();
                if !self.registry.rules.is_allowed(found, expected) {
                    return Err(PipelineError::Connection {
                        upstream_id: upstream,
                        upstream: self.registry.name(upstream).to_string(),
                        downstream_id: node,
                        downstream: self.registry.name(node).to_string(),
                        expected: expected.name(),
                        found: found.name(),
                    });
                }
            }
        }
        Ok(())
    }

    // --- Evaluation ---

    /// Evaluates `handle` sequentially and returns its output.
    pub fn evaluate<I, O: Clone + 'static>(&mut self, handle: &NodeHandle<I, O>) -> Result<O, PipelineError> {
        self.evaluate_with(handle, &EvalOptions::default())
    }

    pub fn evaluate_with<I, O: Clone + 'static>(
        &mut self,
        handle: &NodeHandle<I, O>,
        options: &EvalOptions,
    ) -> Result<O, PipelineError> {
        let id = handle.id();
        self.run(id, options)?;
        self.output(handle).ok_or(PipelineError::UnknownNode(id))
    }

    /// Untyped evaluation entry point; reports what was computed.
    pub fn run(&mut self, root: impl Into<NodeId>, options: &EvalOptions) -> Result<EvalReport, PipelineError> {
        Engine::new(&self.registry).evaluate(root.into(), &mut self.ledger, options)
    }

    // --- Accessors ---

    pub fn output<I, O: Clone + 'static>(&self, handle: &NodeHandle<I, O>) -> Option<O> {
        self.ledger.get(handle.id())?.downcast_ref::<O>().cloned()
    }

    pub fn value(&self, id: impl Into<NodeId>) -> Option<&Value> {
        self.ledger.get(id.into())
    }

    pub fn is_calculated(&self, id: impl Into<NodeId>) -> bool {
        self.ledger.is_calculated(id.into())
    }

    pub fn state(&self, id: impl Into<NodeId>) -> NodeState {
        self.ledger.state(id.into())
    }

    pub fn name(&self, id: impl Into<NodeId>) -> Option<&str> {
        self.registry.meta.get(id.into().index()).map(|m| m.name.as_str())
    }

    pub fn metadata(&self, id: impl Into<NodeId>) -> Option<&NodeMetadata> {
        self.registry.meta.get(id.into().index())
    }

    pub fn input_type(&self, id: impl Into<NodeId>) -> Option<TypeTag> {
        let id = id.into();
        self.registry.contains(id).then(|| self.registry.operator(id).input_tag())
    }

    pub fn output_type(&self, id: impl Into<NodeId>) -> Option<TypeTag> {
        let id = id.into();
        self.registry.contains(id).then(|| self.registry.operator(id).output_tag())
    }

    pub fn upstream(&self, id: impl Into<NodeId>) -> Vec<NodeId> {
        let id = id.into();
        if !self.registry.contains(id) {
            return Vec::new();
        }
        self.registry.get_upstream(id).collect()
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    /// `"<name> - <output>"` rendering of a node.
    pub fn display(&self, id: impl Into<NodeId>) -> NodeDisplay<'_> {
        NodeDisplay { pipeline: self, id: id.into() }
    }

    /// Dependency tree of `root` with cached outputs, see [`format_trace`].
    ///
    /// [`format_trace`]: crate::display::format_trace
    pub fn trace(&self, root: impl Into<NodeId>) -> String {
        crate::display::format_trace(self, root.into())
    }

    // --- Export ---

    pub fn to_digraph(&self) -> DiGraph<String, usize> {
        topology::to_digraph(&self.registry)
    }

    /// Graphviz rendering; edges are labelled with the consumer's input slot.
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.to_digraph()))
    }
}

/// Chainable attachment of inputs to one node. Every attachment appends a
/// slot in call order and makes the node (and its consumers) dirty.
pub struct Attach<'p, I> {
    pipeline: &'p mut Pipeline,
    id: NodeId,
    _input: PhantomData<fn(I)>,
}

impl<'p, I: Send + Sync + 'static> Attach<'p, I> {
    pub fn literal(self, value: impl Into<I>) -> Self {
        self.pipeline.registry.push_literal(self.id, Value::new(value.into()));
        self.pipeline.invalidate(self.id);
        self
    }

    /// Connects `upstream`'s output as the next input. The output type is
    /// checked against `I` when the node is evaluated.
    ///
    /// # Panics
    /// If `upstream` was created by another pipeline.
    pub fn upstream(self, upstream: impl Into<NodeId>) -> Self {
        let upstream = upstream.into();
        assert!(
            self.pipeline.registry.contains(upstream),
            "node {} does not belong to this pipeline",
            upstream
        );
        self.pipeline.registry.push_upstream(self.id, upstream);
        self.pipeline.invalidate(self.id);
        self
    }

    pub fn id(&self) -> NodeId { self.id }
}

pub struct NodeDisplay<'p> {
    pipeline: &'p Pipeline,
    id: NodeId,
}

impl fmt::Display for NodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = &self.pipeline.registry;
        if !registry.contains(self.id) {
            return write!(f, "{} - <unknown node>", self.id);
        }
        match self.pipeline.ledger.get(self.id) {
            Some(value) => write!(f, "{} - {}", registry.name(self.id), registry.operator(self.id).render_output(value)),
            None => write!(f, "{} - <not calculated>", registry.name(self.id)),
        }
    }
}

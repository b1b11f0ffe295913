use super::types::*;
use crate::graph::edge::ConnectionRules;
use crate::graph::node::ErasedOperator;
use smallvec::SmallVec;
use std::fmt;

/// Arena of pipeline nodes, addressed by `NodeId`.
///
/// Columnar layout: per-node vectors share the node index. Upstream links
/// live in each node's ordered input slots; the reverse (upstream -> consumer)
/// links are a linked list of child edges used for downstream invalidation.
#[derive(Default)]
pub struct Registry {
    // Columnar Arrays
    pub meta: Vec<NodeMetadata>,
    pub(crate) operators: Vec<Box<dyn ErasedOperator>>,
    pub inputs: Vec<SmallVec<[InputSlot; 4]>>,

    // Downstream traversal helpers
    pub first_child: Vec<u32>,
    pub child_targets: Vec<NodeId>,
    pub next_child: Vec<u32>,

    // Data Blobs
    pub literals: Vec<Value>,

    pub rules: ConnectionRules,
}

impl Registry {
    pub fn new() -> Self { Self::default() }
    pub fn count(&self) -> usize { self.meta.len() }

    pub fn contains(&self, id: NodeId) -> bool { id.index() < self.count() }

    pub(crate) fn add_node(&mut self, op: Box<dyn ErasedOperator>, meta: NodeMetadata) -> NodeId {
        let id = NodeId::new(self.meta.len());
        self.meta.push(meta);
        self.operators.push(op);
        self.inputs.push(SmallVec::new());
        self.first_child.push(u32::MAX);
        id
    }

    pub(crate) fn push_literal(&mut self, node: NodeId, value: Value) {
        let idx = arena_index(self.literals.len(), "literal");
        self.literals.push(value);
        self.inputs[node.index()].push(InputSlot::Literal(idx));
    }

    pub(crate) fn push_upstream(&mut self, node: NodeId, upstream: NodeId) {
        self.inputs[node.index()].push(InputSlot::Upstream(upstream));

        let u_idx = upstream.index();
        let head = self.first_child[u_idx];
        let new_edge = arena_index(self.child_targets.len(), "child edge");
        self.child_targets.push(node);
        self.next_child.push(head);
        self.first_child[u_idx] = new_edge;
    }

    #[inline(always)]
    pub fn get_inputs(&self, id: NodeId) -> &[InputSlot] {
        &self.inputs[id.index()]
    }

    /// Upstream nodes in declaration order (duplicates kept).
    pub fn get_upstream(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.get_inputs(id).iter().filter_map(|slot| match slot {
            InputSlot::Upstream(u) => Some(*u),
            InputSlot::Literal(_) => None,
        })
    }

    /// Nodes consuming `id`'s output, most recent connection first.
    pub fn get_children(&self, id: NodeId) -> Children<'_> {
        Children { registry: self, edge: self.first_child[id.index()] }
    }

    #[inline(always)]
    pub fn literal(&self, idx: u32) -> &Value {
        &self.literals[idx as usize]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.meta[id.index()].name
    }

    pub(crate) fn operator(&self, id: NodeId) -> &dyn ErasedOperator {
        self.operators[id.index()].as_ref()
    }
}

// `u32::MAX` is reserved as the end-of-list marker for child edges.
fn arena_index(len: usize, what: &str) -> u32 {
    match u32::try_from(len) {
        Ok(idx) if idx != u32::MAX => idx,
        _ => panic!("{} arena exceeds the u32 index range", what),
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("meta", &self.meta)
            .field("inputs", &self.inputs)
            .field("literals", &self.literals.len())
            .field("rules", &self.rules)
            .finish()
    }
}

pub struct Children<'a> {
    registry: &'a Registry,
    edge: u32,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.edge == u32::MAX {
            return None;
        }
        let idx = self.edge as usize;
        self.edge = self.registry.next_child[idx];
        Some(self.registry.child_targets[idx])
    }
}

use crate::store::{NodeId, Registry};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// The upstream relation reachable from a root contains a cycle.
///
/// `downstream` is the node being explored when the cycle was found and
/// `upstream` is the already in-progress node it links back to; that link
/// closes the loop. `path` lists the loop in data-flow order and starts and
/// ends with `upstream`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot connect {}", .path.join(" -> "))]
pub struct CycleError {
    pub upstream_id: NodeId,
    pub upstream: String,
    pub downstream_id: NodeId,
    pub downstream: String,
    pub path: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    None,
    Visiting, // Used for cycle detection
    Visited,
}

/// Proves that the subgraph reachable from `root` is acyclic.
pub fn validate(registry: &Registry, root: NodeId) -> Result<(), CycleError> {
    dependency_order(registry, root, |_| false).map(|_| ())
}

/// Validates every node, including components unreachable from any root.
pub fn validate_all(registry: &Registry) -> Result<(), CycleError> {
    let mut walk = Walk::new(registry, |_: NodeId| false);
    for i in 0..registry.count() {
        let node = NodeId::new(i);
        if walk.state[i] == VisitState::None {
            walk.state[i] = VisitState::Visiting;
            walk.visit(node)?;
        }
    }
    Ok(())
}

/// Performs a depth-first post-order walk of the upstream relation from `root`.
///
/// Returns the visited nodes with every dependency placed before its consumer,
/// `root` last. Nodes for which `settled` returns true are treated as leaves:
/// they are neither descended into nor included in the order. Each call owns
/// its color map, so no state carries over between calls.
pub fn dependency_order<F>(registry: &Registry, root: NodeId, settled: F) -> Result<Vec<NodeId>, CycleError>
where
    F: Fn(NodeId) -> bool,
{
    if settled(root) {
        return Ok(Vec::new());
    }
    let mut walk = Walk::new(registry, settled);
    walk.state[root.index()] = VisitState::Visiting;
    walk.visit(root)?;
    Ok(walk.order)
}

struct Walk<'a, F> {
    registry: &'a Registry,
    settled: F,
    state: Vec<VisitState>,
    /// Grey nodes, from the walk root down to the node being explored.
    path: Vec<NodeId>,
    order: Vec<NodeId>,
}

impl<'a, F: Fn(NodeId) -> bool> Walk<'a, F> {
    fn new(registry: &'a Registry, settled: F) -> Self {
        Self {
            registry,
            settled,
            state: vec![VisitState::None; registry.count()],
            path: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Explores `node`, which the caller has already marked `Visiting`.
    fn visit(&mut self, node: NodeId) -> Result<(), CycleError> {
        self.path.push(node);

        let registry = self.registry;
        for upstream in registry.get_upstream(node) {
            let idx = upstream.index();
            match self.state[idx] {
                VisitState::Visited => {}
                VisitState::Visiting => return Err(self.cycle(node, upstream)),
                VisitState::None => {
                    if (self.settled)(upstream) {
                        self.state[idx] = VisitState::Visited;
                        continue;
                    }
                    self.state[idx] = VisitState::Visiting;
                    self.visit(upstream)?;
                }
            }
        }

        self.path.pop();
        self.state[node.index()] = VisitState::Visited;
        self.order.push(node);
        Ok(())
    }

    fn cycle(&self, downstream: NodeId, upstream: NodeId) -> CycleError {
        // The grey path runs consumer -> upstream; data flows the other way.
        let start = self.path.iter().rposition(|&n| n == upstream).unwrap_or(0);
        let mut path: Vec<String> = Vec::with_capacity(self.path.len() - start + 1);
        path.push(self.registry.name(upstream).to_string());
        for &n in self.path[start..].iter().rev() {
            path.push(self.registry.name(n).to_string());
        }

        CycleError {
            upstream_id: upstream,
            upstream: self.registry.name(upstream).to_string(),
            downstream_id: downstream,
            downstream: self.registry.name(downstream).to_string(),
            path,
        }
    }
}

/// Identifies all nodes downstream from the given start nodes (inclusive).
/// Used for incremental invalidation.
pub fn downstream_from(registry: &Registry, start_nodes: &[NodeId]) -> HashSet<NodeId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from(start_nodes.to_vec());

    while let Some(node) = queue.pop_front() {
        if visited.insert(node) {
            queue.extend(registry.get_children(node));
        }
    }
    visited
}

/// Identifies all nodes upstream from the given start nodes (inclusive).
pub fn upstream_from(registry: &Registry, start_nodes: &[NodeId]) -> HashSet<NodeId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from(start_nodes.to_vec());

    while let Some(node) = queue.pop_front() {
        if visited.insert(node) {
            queue.extend(registry.get_upstream(node));
        }
    }
    visited
}

/// Builds a `petgraph` view of the pipeline for export and inspection.
///
/// Node weights are node names, edges run upstream -> consumer and carry the
/// input slot position the upstream output occupies.
pub fn to_digraph(registry: &Registry) -> DiGraph<String, usize> {
    let mut graph = DiGraph::with_capacity(registry.count(), registry.child_targets.len());
    for meta in &registry.meta {
        graph.add_node(meta.name.clone());
    }
    for i in 0..registry.count() {
        let consumer = NodeId::new(i);
        for (pos, slot) in registry.get_inputs(consumer).iter().enumerate() {
            if let crate::store::InputSlot::Upstream(up) = slot {
                graph.add_edge(NodeIndex::new(up.index()), NodeIndex::new(i), pos);
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{ErasedOperator, FnOperator};
    use crate::store::{NodeMetadata, Value};

    fn op() -> Box<dyn ErasedOperator> {
        Box::new(FnOperator::new(|xs: &[i32]| Ok(xs.iter().sum::<i32>())))
    }

    fn add(reg: &mut Registry, name: &str, upstream: &[NodeId]) -> NodeId {
        let id = reg.add_node(op(), NodeMetadata::named(name));
        for &u in upstream {
            reg.push_upstream(id, u);
        }
        id
    }

    #[test]
    fn test_order_diamond_dependency() {
        // Shape: A -> B, A -> C, B+C -> D
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = add(&mut reg, "B", &[a]);
        let c = add(&mut reg, "C", &[a]);
        let d = add(&mut reg, "D", &[b, c]);

        let res = dependency_order(&reg, d, |_| false).expect("Sort failed");

        assert_eq!(res.len(), 4, "A shared node must appear once");
        let pos = |id: NodeId| res.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
        assert!(validate(&reg, d).is_ok());
    }

    #[test]
    fn test_settled_nodes_are_leaves() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = add(&mut reg, "B", &[a]);
        let c = add(&mut reg, "C", &[b]);

        let res = dependency_order(&reg, c, |n| n == b).unwrap();
        assert_eq!(res, vec![c]);
        assert!(dependency_order(&reg, c, |_| true).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_detection_reports_closing_edge() {
        // A feeds B, B feeds C, C feeds A.
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = add(&mut reg, "B", &[a]);
        let c = add(&mut reg, "C", &[b]);
        reg.push_upstream(a, c);

        for root in [a, b, c] {
            let err = validate(&reg, root).unwrap_err();
            assert_eq!(err.path.len(), 4);
            assert_eq!(err.path.first(), err.path.last());
            assert_eq!(err.path[0], err.upstream);
            assert_eq!(err.path[1], err.downstream);
        }

        let err = validate(&reg, a).unwrap_err();
        // Walk from A: A -> C -> B -> A(grey). B closes the loop back to A.
        assert_eq!(err.downstream, "B");
        assert_eq!(err.upstream, "A");
        assert_eq!(err.to_string(), "cannot connect A -> B -> C -> A");
    }

    #[test]
    fn test_cycle_path_excludes_lead_in() {
        // R consumes A; A and B feed each other.
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = add(&mut reg, "B", &[a]);
        reg.push_upstream(a, b);
        let r = add(&mut reg, "R", &[a]);

        let err = validate(&reg, r).unwrap_err();
        assert!(!err.path.contains(&"R".to_string()));
        assert_eq!(err.to_string(), "cannot connect A -> B -> A");
    }

    #[test]
    fn test_self_loop() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        reg.push_upstream(a, a);
        let err = validate(&reg, a).unwrap_err();
        assert_eq!(err.to_string(), "cannot connect A -> A");
    }

    #[test]
    fn test_validation_runs_do_not_share_state() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = add(&mut reg, "B", &[a]);
        assert!(validate(&reg, b).is_ok());
        assert!(validate(&reg, b).is_ok());

        reg.push_upstream(a, b);
        assert!(validate(&reg, b).is_err());
        assert!(validate(&reg, b).is_err());
    }

    #[test]
    fn test_validate_all_finds_disconnected_cycle() {
        let mut reg = Registry::new();
        let lone = add(&mut reg, "lone", &[]);
        let x = add(&mut reg, "X", &[]);
        let y = add(&mut reg, "Y", &[x]);
        reg.push_upstream(x, y);

        assert!(validate(&reg, lone).is_ok());
        assert!(validate_all(&reg).is_err());
    }

    #[test]
    fn test_literals_do_not_affect_topology() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        reg.push_literal(a, Value::new(1_i32));
        let b = add(&mut reg, "B", &[]);
        reg.push_literal(b, Value::new(2_i32));
        reg.push_upstream(b, a);

        assert_eq!(dependency_order(&reg, b, |_| false).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_downstream_and_upstream_closure() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = add(&mut reg, "B", &[a]);
        let c = add(&mut reg, "C", &[b]);
        let other = add(&mut reg, "other", &[]);

        let down = downstream_from(&reg, &[b]);
        assert_eq!(down, HashSet::from([b, c]));
        let up = upstream_from(&reg, &[c]);
        assert_eq!(up, HashSet::from([a, b, c]));
        assert!(!up.contains(&other));
    }

    #[test]
    fn test_to_digraph_edges_carry_slot_position() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "A", &[]);
        let b = reg.add_node(op(), NodeMetadata::named("B"));
        reg.push_literal(b, Value::new(0_i32));
        reg.push_upstream(b, a);

        let g = to_digraph(&reg);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 1);
        let edge = g.edge_indices().next().unwrap();
        assert_eq!(g.edge_weight(edge), Some(&1));
        assert_eq!(g.edge_endpoints(edge), Some((NodeIndex::new(0), NodeIndex::new(1))));
    }
}

use crate::compute::Ledger;
use crate::graph::Pipeline;
use crate::store::{InputSlot, NodeId, Registry};
use std::collections::HashMap;
use std::fmt::Write;

/// Renders the dependency tree of `target` with each node's cached output.
///
/// Upstream nodes and literals are listed in input-slot order. A node reached
/// a second time (a shared dependency) is printed as a reference to the level
/// where it first appeared instead of being expanded again.
pub fn format_trace(pipeline: &Pipeline, target: NodeId) -> String {
    let mut tracer = Tracer {
        registry: &pipeline.registry,
        ledger: &pipeline.ledger,
        visited_at_level: HashMap::new(),
        output: String::new(),
    };

    if tracer.registry.contains(target) {
        let name = tracer.registry.name(target);
        let _ = writeln!(tracer.output, "TRACE for node '{}':", name);
        let _ = writeln!(tracer.output, "--------------------------------------------------");
        tracer.trace_node(target, 1, "");
    } else {
        let _ = writeln!(tracer.output, "Error: Invalid Node ID {}", target);
    }
    tracer.output
}

struct Tracer<'a> {
    registry: &'a Registry,
    ledger: &'a Ledger,
    visited_at_level: HashMap<NodeId, usize>,
    output: String,
}

impl<'a> Tracer<'a> {
    fn trace_node(&mut self, node_id: NodeId, level: usize, prefix: &str) {
        let registry = self.registry;
        let name = registry.name(node_id);
        if let Some(&first_seen) = self.visited_at_level.get(&node_id) {
            let _ = writeln!(self.output, "{}{} -> (Ref to L{})", prefix, name, first_seen);
            return;
        }
        self.visited_at_level.insert(node_id, level);

        let value = self.format_value(node_id);
        let _ = writeln!(self.output, "{}[L{}] {} {}", prefix, level, name, value);

        let slots = registry.get_inputs(node_id);
        let stem = build_child_stem(prefix);
        for (i, slot) in slots.iter().enumerate() {
            let connector = if i == slots.len() - 1 { "`-- " } else { "|-- " };
            let full_prefix = format!("{}{}", stem, connector);
            match *slot {
                InputSlot::Literal(idx) => {
                    let literal = registry.operator(node_id).render_input(registry.literal(idx));
                    let _ = writeln!(self.output, "{}Literal({})", full_prefix, literal);
                }
                InputSlot::Upstream(upstream) => self.trace_node(upstream, level + 1, &full_prefix),
            }
        }
    }

    fn format_value(&self, id: NodeId) -> String {
        match self.ledger.get(id) {
            Some(v) => format!("[{}]", self.registry.operator(id).render_output(v)),
            None => "[?]".to_string(),
        }
    }
}

fn build_child_stem(current_prefix: &str) -> String {
    current_prefix.replace("`-- ", "    ").replace("|-- ", "|   ")
}

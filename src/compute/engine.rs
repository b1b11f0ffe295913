//! The evaluation engine: resolves the dirty dependencies of a root node and
//! runs their compute steps, either sequentially or fanned out over rayon.
use crate::analysis::topology;
use crate::compute::ledger::{Ledger, NodeState, PipelineError};
use crate::compute::schedule::{EvalOptions, Schedule};
use crate::store::{InputSlot, NodeId, Registry, Value};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, info, trace, warn};

/// What a single evaluation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalReport {
    /// Nodes whose compute step ran, in completion order.
    pub computed: Vec<NodeId>,
    /// Display lines emitted by nodes with `display_output` set.
    pub displayed: Vec<String>,
}

pub struct Engine<'a> {
    registry: &'a Registry,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Ensures `root` and everything it transitively depends on is calculated.
    ///
    /// Nodes already calculated are reused as-is. The dirty part of the graph
    /// is ordered with a depth-first walk (which also rejects cycles) and then
    /// computed according to `options.schedule`. A failure stops only the
    /// failed node and its consumers: independent branches still run and keep
    /// their cached outputs, and the first error is returned.
    pub fn evaluate(&self, root: NodeId, ledger: &mut Ledger, options: &EvalOptions) -> Result<EvalReport, PipelineError> {
        if !self.registry.contains(root) {
            return Err(PipelineError::UnknownNode(root));
        }
        if ledger.is_calculated(root) {
            trace!(node = %self.registry.name(root), "cache hit");
            return Ok(EvalReport::default());
        }

        let plan = topology::dependency_order(self.registry, root, |n| ledger.is_calculated(n))?;
        trace!(root = %self.registry.name(root), planned = plan.len(), "evaluation plan built");

        let result = match options.schedule {
            Schedule::Sequential => self.run_sequential(&plan, ledger),
            Schedule::Parallel { threads } => self.run_parallel(&plan, ledger, threads),
        };

        if let Err(e) = &result {
            warn!(root = %self.registry.name(root), error = %e, "evaluation failed");
        }
        result
    }

    fn run_sequential(&self, plan: &[NodeId], ledger: &mut Ledger) -> Result<EvalReport, PipelineError> {
        let mut report = EvalReport::default();
        let mut failure: Option<PipelineError> = None;
        // Nodes that failed, or that consume a failed node, in this run.
        let mut blocked: HashSet<NodeId> = HashSet::new();

        for &node in plan {
            if self.registry.get_upstream(node).any(|u| blocked.contains(&u)) {
                blocked.insert(node);
                continue;
            }
            // The plan puts dependencies first, so every upstream is in the ledger by now.
            match self.evaluate_node(node, |u| ledger.get(u).cloned()) {
                Ok(value) => {
                    self.announce(node, &value, &mut report);
                    ledger.insert(node, value);
                }
                Err(e) => {
                    blocked.insert(node);
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn run_parallel(&self, plan: &[NodeId], ledger: &mut Ledger, threads: Option<usize>) -> Result<EvalReport, PipelineError> {
        let fanout = FanOut::new(self, plan, ledger);
        match threads {
            None => fanout.run(),
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;
                pool.install(|| fanout.run());
            }
        }

        let (outputs, report, failure) = fanout.finish();
        for (node, value) in outputs {
            ledger.insert(node, value);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Gathers a node's inputs in slot order and runs its compute step.
    ///
    /// `lookup` returns the cached output of an upstream node. Each upstream
    /// output goes through the connection rules before it is passed on.
    fn evaluate_node<F>(&self, node: NodeId, lookup: F) -> Result<Value, PipelineError>
    where
        F: Fn(NodeId) -> Option<Value>,
    {
        let op = self.registry.operator(node);
        let expected = op.input_tag();
        let slots = self.registry.get_inputs(node);

        let mut inputs = Vec::with_capacity(slots.len());
        for slot in slots {
            match *slot {
                InputSlot::Literal(idx) => inputs.push(self.registry.literal(idx).clone()),
                InputSlot::Upstream(upstream) => {
                    let value = lookup(upstream).ok_or_else(|| PipelineError::UnresolvedInput {
                        node_id: node,
                        node: self.registry.name(node).to_string(),
                        upstream_id: upstream,
                        upstream: self.registry.name(upstream).to_string(),
                    })?;
                    let connected = self.registry.rules.resolve(&value, expected).ok_or_else(|| {
                        PipelineError::Connection {
                            upstream_id: upstream,
                            upstream: self.registry.name(upstream).to_string(),
                            downstream_id: node,
                            downstream: self.registry.name(node).to_string(),
                            expected: expected.name(),
                            found: value.tag().name(),
                        }
                    })?;
                    inputs.push(connected);
                }
            }
        }

        debug!(node = %self.registry.name(node), id = node.0, inputs = inputs.len(), "executing");
        op.invoke(&inputs).map_err(|source| PipelineError::Compute {
            node_id: node,
            node: self.registry.name(node).to_string(),
            source,
        })
    }

    fn announce(&self, node: NodeId, value: &Value, report: &mut EvalReport) {
        report.computed.push(node);
        let meta = &self.registry.meta[node.index()];
        if meta.display_output {
            let line = format!("{} - {}", meta.name, self.registry.operator(node).render_output(value));
            info!(target: "pipeline_core::display", "{}", line);
            report.displayed.push(line);
        }
    }
}

/// Shared state of one parallel evaluation.
///
/// Every planned node counts its distinct planned upstream nodes. A finished
/// node decrements the counters of its consumers and the task that brings a
/// counter to zero spawns that consumer, so each node is spawned once no
/// matter how many paths reach it. A failed node never releases its
/// consumers, so their subtree is skipped while unrelated branches finish.
/// The `Dirty -> Evaluating` exchange on `states` claims the compute step, so
/// a node handed to `execute` twice still computes once.
struct FanOut<'e, 'a> {
    engine: &'e Engine<'a>,
    plan: &'e [NodeId],
    ledger: &'e Ledger,
    position: HashMap<NodeId, usize>,
    children: Vec<SmallVec<[usize; 4]>>,
    pending: Vec<AtomicUsize>,
    states: Vec<AtomicU8>,
    outputs: Vec<OnceLock<Value>>,
    report: Mutex<EvalReport>,
    failure: Mutex<Option<PipelineError>>,
}

impl<'e, 'a> FanOut<'e, 'a> {
    fn new(engine: &'e Engine<'a>, plan: &'e [NodeId], ledger: &'e Ledger) -> Self {
        let position: HashMap<NodeId, usize> = plan.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut children: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); plan.len()];
        let mut pending = Vec::with_capacity(plan.len());
        for (i, &node) in plan.iter().enumerate() {
            let mut deps: SmallVec<[usize; 4]> = SmallVec::new();
            for upstream in engine.registry.get_upstream(node) {
                if let Some(&d) = position.get(&upstream) {
                    if !deps.contains(&d) {
                        deps.push(d);
                    }
                }
            }
            for &d in &deps {
                children[d].push(i);
            }
            pending.push(AtomicUsize::new(deps.len()));
        }

        Self {
            engine,
            plan,
            ledger,
            position,
            children,
            pending,
            states: (0..plan.len()).map(|_| AtomicU8::new(NodeState::Dirty as u8)).collect(),
            outputs: (0..plan.len()).map(|_| OnceLock::new()).collect(),
            report: Mutex::new(EvalReport::default()),
            failure: Mutex::new(None),
        }
    }

    fn run(&self) {
        let ready: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.load(Ordering::Relaxed) == 0)
            .map(|(i, _)| i)
            .collect();

        rayon::scope(|s| {
            for idx in ready {
                s.spawn(move |s| self.execute(idx, s));
            }
        });
    }

    fn execute<'s>(&'s self, idx: usize, scope: &rayon::Scope<'s>) {
        let claimed = self.states[idx].compare_exchange(
            NodeState::Dirty as u8,
            NodeState::Evaluating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let node = self.plan[idx];
        if let Err(current) = claimed {
            trace!(node = %self.engine.registry.name(node), state = ?NodeState::from_u8(current), "already claimed");
            return;
        }

        match self.engine.evaluate_node(node, |u| self.lookup(u)) {
            Ok(value) => {
                {
                    let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
                    self.engine.announce(node, &value, &mut report);
                }
                let _ = self.outputs[idx].set(value);
                self.states[idx].store(NodeState::Calculated as u8, Ordering::Release);

                for &child in &self.children[idx] {
                    // Join barrier: the last finishing upstream releases the child.
                    if self.pending[child].fetch_sub(1, Ordering::AcqRel) == 1 {
                        scope.spawn(move |s| self.execute(child, s));
                    }
                }
            }
            Err(e) => {
                self.states[idx].store(NodeState::Dirty as u8, Ordering::Release);
                self.fail(e);
            }
        }
    }

    fn lookup(&self, upstream: NodeId) -> Option<Value> {
        match self.position.get(&upstream) {
            Some(&i) => self.outputs[i].get().cloned(),
            None => self.ledger.get(upstream).cloned(),
        }
    }

    fn fail(&self, error: PipelineError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn finish(self) -> (Vec<(NodeId, Value)>, EvalReport, Option<PipelineError>) {
        let outputs = self
            .plan
            .iter()
            .zip(self.outputs)
            .filter_map(|(&node, cell)| cell.into_inner().map(|v| (node, v)))
            .collect();
        let report = self.report.into_inner().unwrap_or_else(PoisonError::into_inner);
        let failure = self.failure.into_inner().unwrap_or_else(PoisonError::into_inner);
        (outputs, report, failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeError;
    use crate::graph::node::{ErasedOperator, FnOperator};
    use crate::store::NodeMetadata;
    use rstest::rstest;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn concat() -> Box<dyn ErasedOperator> {
        Box::new(FnOperator::new(|xs: &[String]| Ok(xs.concat())))
    }

    fn node(reg: &mut Registry, name: &str) -> NodeId {
        reg.add_node(concat(), NodeMetadata::named(name))
    }

    fn text(ledger: &Ledger, id: NodeId) -> Option<String> {
        ledger.get(id).and_then(|v| v.downcast_ref::<String>().cloned())
    }

    #[rstest]
    #[case(EvalOptions::sequential())]
    #[case(EvalOptions::parallel())]
    #[case(EvalOptions::default().with_schedule(Schedule::Parallel { threads: Some(2) }))]
    fn test_evaluate_chain(#[case] options: EvalOptions) {
        let mut reg = Registry::new();
        let f1 = node(&mut reg, "f1");
        reg.push_literal(f1, Value::new("f1i1".to_string()));
        reg.push_literal(f1, Value::new("f1i2".to_string()));
        let f2 = node(&mut reg, "f2");
        reg.push_upstream(f2, f1);
        reg.push_literal(f2, Value::new("f2i1".to_string()));

        let mut ledger = Ledger::new();
        let report = Engine::new(&reg).evaluate(f2, &mut ledger, &options).unwrap();

        assert_eq!(report.computed, vec![f1, f2]);
        assert_eq!(text(&ledger, f2).as_deref(), Some("f1i1f1i2f2i1"));
        assert_eq!(text(&ledger, f1).as_deref(), Some("f1i1f1i2"));
    }

    #[test]
    fn test_unknown_root() {
        let reg = Registry::new();
        let mut ledger = Ledger::new();
        let err = Engine::new(&reg).evaluate(NodeId::new(5), &mut ledger, &EvalOptions::default()).unwrap_err();
        assert_eq!(err, PipelineError::UnknownNode(NodeId::new(5)));
    }

    #[test]
    fn test_parallel_keeps_declaration_order_under_skewed_timing() {
        // The first branch finishes last; inputs must still follow slot order.
        let mut reg = Registry::new();
        let slow = reg.add_node(
            Box::new(FnOperator::new(|_: &[String]| {
                thread::sleep(Duration::from_millis(30));
                Ok("slow".to_string())
            })),
            NodeMetadata::named("slow"),
        );
        let fast = reg.add_node(
            Box::new(FnOperator::new(|_: &[String]| Ok("fast".to_string()))),
            NodeMetadata::named("fast"),
        );
        let join = node(&mut reg, "join");
        reg.push_upstream(join, slow);
        reg.push_literal(join, Value::new("|".to_string()));
        reg.push_upstream(join, fast);

        let mut ledger = Ledger::new();
        Engine::new(&reg).evaluate(join, &mut ledger, &EvalOptions::parallel()).unwrap();
        assert_eq!(text(&ledger, join).as_deref(), Some("slow|fast"));
    }

    fn failing() -> Box<dyn ErasedOperator> {
        Box::new(FnOperator::new(|_: &[String]| -> Result<String, ComputeError> { Err(ComputeError::new("boom")) }))
    }

    #[rstest]
    #[case::sequential_bad_last(EvalOptions::sequential(), false)]
    #[case::sequential_bad_first(EvalOptions::sequential(), true)]
    #[case::one_thread_bad_last(EvalOptions::default().with_schedule(Schedule::Parallel { threads: Some(1) }), false)]
    #[case::one_thread_bad_first(EvalOptions::default().with_schedule(Schedule::Parallel { threads: Some(1) }), true)]
    #[case::four_threads_bad_last(EvalOptions::default().with_schedule(Schedule::Parallel { threads: Some(4) }), false)]
    #[case::four_threads_bad_first(EvalOptions::default().with_schedule(Schedule::Parallel { threads: Some(4) }), true)]
    fn test_failure_keeps_independent_branches(#[case] options: EvalOptions, #[case] bad_first: bool) {
        let mut reg = Registry::new();
        let ok = node(&mut reg, "ok");
        reg.push_literal(ok, Value::new("x".to_string()));
        let ok_next = node(&mut reg, "ok_next");
        reg.push_upstream(ok_next, ok);
        let bad = reg.add_node(failing(), NodeMetadata::named("bad"));
        let after_bad = node(&mut reg, "after_bad");
        reg.push_upstream(after_bad, bad);

        let root = node(&mut reg, "root");
        if bad_first {
            reg.push_upstream(root, after_bad);
            reg.push_upstream(root, ok_next);
        } else {
            reg.push_upstream(root, ok_next);
            reg.push_upstream(root, after_bad);
        }

        let mut ledger = Ledger::new();
        let err = Engine::new(&reg).evaluate(root, &mut ledger, &options).unwrap_err();

        assert!(matches!(err, PipelineError::Compute { ref node, .. } if node == "bad"));
        assert_eq!(text(&ledger, ok).as_deref(), Some("x"));
        assert_eq!(text(&ledger, ok_next).as_deref(), Some("x"));
        assert!(!ledger.is_calculated(bad));
        assert!(!ledger.is_calculated(after_bad));
        assert!(!ledger.is_calculated(root));
    }

    #[test]
    fn test_fanout_reports_first_error_of_several() {
        let mut reg = Registry::new();
        let bad1 = reg.add_node(failing(), NodeMetadata::named("bad1"));
        let bad2 = reg.add_node(failing(), NodeMetadata::named("bad2"));
        let root = node(&mut reg, "root");
        reg.push_upstream(root, bad1);
        reg.push_upstream(root, bad2);

        let mut ledger = Ledger::new();
        let options = EvalOptions::default().with_schedule(Schedule::Parallel { threads: Some(2) });
        let err = Engine::new(&reg).evaluate(root, &mut ledger, &options).unwrap_err();

        assert!(matches!(err, PipelineError::Compute { ref node, .. } if node == "bad1" || node == "bad2"));
        assert_eq!(ledger.calculated_count(), 0);
    }

    #[test]
    fn test_fanout_claim_computes_once_when_spawned_twice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut reg = Registry::new();
        let a = reg.add_node(
            Box::new(FnOperator::new(move |_: &[String]| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("a".to_string())
            })),
            NodeMetadata::named("A"),
        );

        let plan = vec![a];
        let ledger = Ledger::new();
        let engine = Engine::new(&reg);
        let fanout = FanOut::new(&engine, &plan, &ledger);
        rayon::scope(|s| {
            fanout.execute(0, s);
            fanout.execute(0, s);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (outputs, report, failure) = fanout.finish();
        assert_eq!(outputs.len(), 1);
        assert_eq!(report.computed, vec![a]);
        assert!(failure.is_none());
    }

    #[test]
    fn test_parallel_runs_shared_node_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut reg = Registry::new();
        let a = reg.add_node(
            Box::new(FnOperator::new(move |_: &[String]| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("a".to_string())
            })),
            NodeMetadata::named("A"),
        );
        // Wide fan-out over a single shared upstream.
        let branches: Vec<NodeId> = (0..16)
            .map(|i| {
                let b = node(&mut reg, &format!("B{}", i));
                reg.push_upstream(b, a);
                b
            })
            .collect();
        let root = node(&mut reg, "root");
        for &b in &branches {
            reg.push_upstream(root, b);
        }

        let mut ledger = Ledger::new();
        let report = Engine::new(&reg).evaluate(root, &mut ledger, &EvalOptions::parallel()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.computed.len(), 18);
        assert_eq!(report.computed.first(), Some(&a));
        assert_eq!(report.computed.last(), Some(&root));
        assert_eq!(text(&ledger, root), Some("a".repeat(16)));
    }

    #[test]
    fn test_fanout_counts_duplicate_upstream_once() {
        let mut reg = Registry::new();
        let a = node(&mut reg, "A");
        let b = node(&mut reg, "B");
        reg.push_upstream(b, a);
        reg.push_upstream(b, a);

        let plan = vec![a, b];
        let ledger = Ledger::new();
        let engine = Engine::new(&reg);
        let fanout = FanOut::new(&engine, &plan, &ledger);
        assert_eq!(fanout.pending[1].load(Ordering::Relaxed), 1);
        assert_eq!(fanout.children[0].as_slice(), &[1]);
    }
}

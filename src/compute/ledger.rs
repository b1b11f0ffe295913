//! ledger.rs
//! Memoized node outputs, plus the error types of evaluation.

use crate::store::{NodeId, Value};

pub use self::error::{ComputeError, PipelineError};
mod error {
    use crate::analysis::CycleError;
    use crate::store::NodeId;
    use thiserror::Error;

    /// Domain failure raised by a node's own compute step.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("{message}")]
    pub struct ComputeError {
        message: String,
    }

    impl ComputeError {
        pub fn new(message: impl Into<String>) -> Self {
            Self { message: message.into() }
        }

        pub fn message(&self) -> &str { &self.message }
    }

    impl From<String> for ComputeError {
        fn from(message: String) -> Self { Self { message } }
    }

    impl From<&str> for ComputeError {
        fn from(message: &str) -> Self { Self::new(message) }
    }

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum PipelineError {
        #[error(transparent)]
        Cycle(#[from] CycleError),
        #[error("Could not connect '{upstream}' -> '{downstream}': expected {expected}, found {found}")]
        Connection {
            upstream_id: NodeId,
            upstream: String,
            downstream_id: NodeId,
            downstream: String,
            expected: &'static str,
            found: &'static str,
        },
        #[error("Node '{node}' failed: {source}")]
        Compute { node_id: NodeId, node: String, source: ComputeError },
        #[error("Upstream '{upstream}' of node '{node}' has no cached output")]
        UnresolvedInput { node_id: NodeId, node: String, upstream_id: NodeId, upstream: String },
        #[error("Node {0} does not belong to this pipeline")]
        UnknownNode(NodeId),
        #[error("Failed to build evaluation thread pool: {0}")]
        ThreadPool(String),
    }

    impl PipelineError {
        /// The node whose evaluation failed, when the error concerns one.
        pub fn node_id(&self) -> Option<NodeId> {
            match self {
                PipelineError::Cycle(e) => Some(e.downstream_id),
                PipelineError::Connection { downstream_id, .. } => Some(*downstream_id),
                PipelineError::Compute { node_id, .. } => Some(*node_id),
                PipelineError::UnresolvedInput { node_id, .. } => Some(*node_id),
                PipelineError::UnknownNode(id) => Some(*id),
                PipelineError::ThreadPool(_) => None,
            }
        }
    }
}

/// Per-node evaluation state.
///
/// `Evaluating` only exists inside a parallel evaluation, where it marks the
/// task that claimed the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Dirty = 0,
    Evaluating = 1,
    Calculated = 2,
}

impl NodeState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NodeState::Evaluating,
            2 => NodeState::Calculated,
            _ => NodeState::Dirty,
        }
    }
}

/// Dense storage of cached outputs. A node is calculated exactly when its
/// slot holds a value.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    values: Vec<Option<Value>>,
}

impl Ledger {
    pub fn new() -> Self { Self::default() }

    pub fn ensure_capacity(&mut self, size: usize) {
        if self.values.len() < size {
            self.values.resize(size, None);
        }
    }

    #[inline(always)]
    pub fn get(&self, node_id: NodeId) -> Option<&Value> {
        self.values.get(node_id.index())?.as_ref()
    }

    #[inline(always)]
    pub fn is_calculated(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_some()
    }

    pub fn state(&self, node_id: NodeId) -> NodeState {
        if self.is_calculated(node_id) { NodeState::Calculated } else { NodeState::Dirty }
    }

    pub fn insert(&mut self, node_id: NodeId, value: Value) {
        let idx = node_id.index();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, None);
        }
        self.values[idx] = Some(value);
    }

    pub fn invalidate(&mut self, node_ids: impl IntoIterator<Item = NodeId>) {
        for id in node_ids {
            if let Some(slot) = self.values.get_mut(id.index()) {
                *slot = None;
            }
        }
    }

    pub fn calculated_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

//! Evaluates the pipeline graph.
pub mod engine;
pub mod ledger;
pub mod schedule;

pub use engine::{Engine, EvalReport};
pub use ledger::{ComputeError, Ledger, NodeState, PipelineError};
pub use schedule::{EvalOptions, Schedule};

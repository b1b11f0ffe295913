//! A dataflow pipeline executor.
//!
//! Nodes form a directed acyclic graph. Each node turns an ordered sequence of
//! typed inputs (literal values and the outputs of its upstream nodes, in the
//! order they were attached) into one typed output. Evaluation is memoized,
//! dependency-ordered and can fan independent branches out over rayon.
//!
//! ```
//! use pipeline_core::{EvalOptions, Pipeline};
//!
//! let mut p = Pipeline::new();
//! let f1 = p.add_fn("f1", |xs: &[String]| Ok(xs.concat()));
//! let f2 = p.add_fn("f2", |xs: &[String]| Ok(xs.concat()));
//! p.node(&f1).literal("f1i1").literal("f1i2");
//! p.node(&f2).upstream(f1).literal("f2i1");
//!
//! p.validate(f2).unwrap();
//! let out = p.evaluate_with(&f2, &EvalOptions::parallel()).unwrap();
//! assert_eq!(out, "f1i1f1i2f2i1");
//! assert_eq!(p.output(&f1).as_deref(), Some("f1i1f1i2"));
//! ```

pub mod analysis;
pub mod compute;
pub mod display;
pub mod graph;
pub mod store;

pub use analysis::CycleError;
pub use compute::{ComputeError, EvalOptions, EvalReport, NodeState, PipelineError, Schedule};
pub use graph::{FnOperator, NodeHandle, Operator, Pipeline};
pub use store::{NodeId, Value};

//! Structural analysis of the pipeline graph: cycle validation, dependency
//! ordering and reachability.
pub mod topology;

pub use topology::{dependency_order, downstream_from, upstream_from, validate, validate_all, CycleError};

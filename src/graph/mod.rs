//! Graph construction: typed node handles, compute-step operators,
//! connection rules and the `Pipeline` facade.
pub mod dag;
pub mod edge;
pub mod node;

// Re-export key types for convenient access
pub use dag::{Attach, NodeDisplay, Pipeline};
pub use edge::ConnectionRules;
pub use node::{FnOperator, NodeHandle, Operator};

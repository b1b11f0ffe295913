//! Node storage: the arena of nodes, their ordered input slots and the
//! type-erased values flowing between them.
pub mod registry;
pub mod types;

pub use registry::{Children, Registry};
pub use types::{InputSlot, NodeId, NodeMetadata, TypeTag, Value};

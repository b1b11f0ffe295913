use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    /// Panics if `idx` does not fit the `u32` id space.
    pub fn new(idx: usize) -> Self {
        match u32::try_from(idx) {
            Ok(raw) => Self(raw),
            Err(_) => panic!("node index {} exceeds the NodeId range", idx),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Diagnostic name. Several nodes may share it.
    pub name: String,
    /// Emit `"<name> - <output>"` every time the node is computed.
    pub display_output: bool,
}

impl NodeMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), display_output: false }
    }
}

/// One entry of a node's ordered input list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSlot {
    /// Index into `Registry::literals`.
    Literal(u32),
    Upstream(NodeId),
}

/// Runtime identity of a Rust type, used for connection checks.
#[derive(Debug, Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: Any>() -> Self {
        Self { id: TypeId::of::<T>(), name: std::any::type_name::<T>() }
    }

    pub fn id(&self) -> TypeId { self.id }
    pub fn name(&self) -> &'static str { self.name }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) { self.id.hash(state) }
}

/// A type-erased, cheaply clonable node value (literal or computed output).
#[derive(Clone)]
pub struct Value {
    tag: TypeTag,
    data: Arc<dyn Any + Send + Sync>,
}

impl Value {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self { tag: TypeTag::of::<T>(), data: Arc::new(value) }
    }

    #[inline(always)]
    pub fn tag(&self) -> TypeTag { self.tag }

    pub fn is<T: Any>(&self) -> bool { self.tag.id == TypeId::of::<T>() }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// True when both values share the same allocation.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>", self.tag.name)
    }
}

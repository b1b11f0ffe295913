//! Connection rules: which upstream output types may feed which input types.

use crate::store::{TypeTag, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

type Converter = fn(&Value) -> Option<Value>;

/// Type-checks an upstream output against the input type a consumer expects.
///
/// Identical types always connect. Other pairs connect only if a lossless
/// conversion was registered with [`ConnectionRules::allow`].
#[derive(Clone, Default)]
pub struct ConnectionRules {
    converters: HashMap<(TypeTag, TypeTag), Converter>,
}

impl ConnectionRules {
    pub fn new() -> Self { Self::default() }

    /// Allows outputs of type `A` to feed inputs of type `B` through `B::from`.
    pub fn allow<A, B>(&mut self)
    where
        A: Any + Clone + Send + Sync,
        B: From<A> + Any + Send + Sync,
    {
        self.converters.insert((TypeTag::of::<A>(), TypeTag::of::<B>()), convert::<A, B>);
    }

    pub fn is_allowed(&self, from: TypeTag, to: TypeTag) -> bool {
        from == to || self.converters.contains_key(&(from, to))
    }

    /// Returns `value` as the `expected` type, or `None` if the types cannot connect.
    pub fn resolve(&self, value: &Value, expected: TypeTag) -> Option<Value> {
        if value.tag() == expected {
            return Some(value.clone());
        }
        let converter = self.converters.get(&(value.tag(), expected))?;
        converter(value)
    }
}

impl fmt::Debug for ConnectionRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.converters.keys().map(|(from, to)| format!("{} -> {}", from.name(), to.name())))
            .finish()
    }
}

fn convert<A, B>(value: &Value) -> Option<Value>
where
    A: Any + Clone + Send + Sync,
    B: From<A> + Any + Send + Sync,
{
    value.downcast_ref::<A>().map(|a| Value::new(B::from(a.clone())))
}

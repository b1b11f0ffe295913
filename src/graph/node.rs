//! Defines the `Operator` trait (a node's compute step) and the typed
//! `NodeHandle` used to address nodes inside a `Pipeline`.

use crate::compute::ComputeError;
use crate::store::{NodeId, TypeTag, Value};
use std::fmt;
use std::marker::PhantomData;

/// The user-supplied compute step of a node.
///
/// A node consumes an ordered sequence of `Input` values (its literals and the
/// outputs of its upstream nodes, interleaved in attachment order) and produces
/// a single `Output`. The engine never inspects what the step does.
pub trait Operator: Send + Sync + 'static {
    type Input: Clone + fmt::Debug + Send + Sync + 'static;
    type Output: Clone + fmt::Debug + Send + Sync + 'static;

    /// Computes the node output. `inputs` is a read-only view that is only
    /// valid for the duration of the call.
    fn compute(&self, inputs: &[Self::Input]) -> Result<Self::Output, ComputeError>;

    /// Human-readable form of an output, used for display lines and traces.
    fn render(&self, output: &Self::Output) -> String {
        format!("{:?}", output)
    }
}

/// An `Operator` backed by a closure.
pub struct FnOperator<I, O, F> {
    f: F,
    render: Option<fn(&O) -> String>,
    _types: PhantomData<fn(&[I]) -> O>,
}

impl<I, O, F> FnOperator<I, O, F>
where
    F: Fn(&[I]) -> Result<O, ComputeError>,
{
    pub fn new(f: F) -> Self {
        Self { f, render: None, _types: PhantomData }
    }

    /// Overrides the default `Debug` rendering of outputs.
    pub fn with_render(mut self, render: fn(&O) -> String) -> Self {
        self.render = Some(render);
        self
    }
}

impl<I, O, F> Operator for FnOperator<I, O, F>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
    O: Clone + fmt::Debug + Send + Sync + 'static,
    F: Fn(&[I]) -> Result<O, ComputeError> + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn compute(&self, inputs: &[I]) -> Result<O, ComputeError> {
        (self.f)(inputs)
    }

    fn render(&self, output: &O) -> String {
        match self.render {
            Some(render) => render(output),
            None => format!("{:?}", output),
        }
    }
}

/// Object-safe view of an `Operator` with its input/output types erased.
pub(crate) trait ErasedOperator: Send + Sync {
    fn input_tag(&self) -> TypeTag;
    fn output_tag(&self) -> TypeTag;
    fn invoke(&self, inputs: &[Value]) -> Result<Value, ComputeError>;
    fn render_output(&self, value: &Value) -> String;
    fn render_input(&self, value: &Value) -> String;
}

impl<Op: Operator> ErasedOperator for Op {
    fn input_tag(&self) -> TypeTag { TypeTag::of::<Op::Input>() }

    fn output_tag(&self) -> TypeTag { TypeTag::of::<Op::Output>() }

    fn invoke(&self, inputs: &[Value]) -> Result<Value, ComputeError> {
        // Connections are checked before invocation; a failed downcast here
        // means a value bypassed that check.
        let typed = inputs
            .iter()
            .map(|v| {
                v.downcast_ref::<Op::Input>().cloned().ok_or_else(|| {
                    ComputeError::new(format!(
                        "input of type {} cannot be read as {}",
                        v.tag().name(),
                        std::any::type_name::<Op::Input>()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.compute(&typed).map(Value::new)
    }

    fn render_output(&self, value: &Value) -> String {
        match value.downcast_ref::<Op::Output>() {
            Some(out) => self.render(out),
            None => format!("{:?}", value),
        }
    }

    fn render_input(&self, value: &Value) -> String {
        match value.downcast_ref::<Op::Input>() {
            Some(input) => format!("{:?}", input),
            None => format!("{:?}", value),
        }
    }
}

/// A typed reference to a node of a `Pipeline`, consuming `I` and producing `O`.
pub struct NodeHandle<I, O> {
    id: NodeId,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> NodeHandle<I, O> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self { id, _types: PhantomData }
    }

    pub fn id(&self) -> NodeId { self.id }
}

impl<I, O> Clone for NodeHandle<I, O> {
    fn clone(&self) -> Self { *self }
}

impl<I, O> Copy for NodeHandle<I, O> {}

impl<I, O> PartialEq for NodeHandle<I, O> {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl<I, O> Eq for NodeHandle<I, O> {}

impl<I, O> fmt::Debug for NodeHandle<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.id).finish()
    }
}

impl<I, O> From<NodeHandle<I, O>> for NodeId {
    fn from(handle: NodeHandle<I, O>) -> Self { handle.id }
}

impl<I, O> From<&NodeHandle<I, O>> for NodeId {
    fn from(handle: &NodeHandle<I, O>) -> Self { handle.id }
}

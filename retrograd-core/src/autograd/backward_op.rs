use std::fmt::Debug;
use std::sync::Arc;

use crate::accelerator::Stream;
use crate::device::Device;
use crate::error::RetrogradError;
use crate::tensor::Tensor;
use crate::types::DType;

use super::graph::Edge;

/// Expected shape, dtype and device of one gradient input of a node.
///
/// Recorded during forward; the engine validates and coerces every incoming
/// gradient against it before accumulation.
#[derive(Debug, Clone, PartialEq)]
pub struct InputMetadata {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub device: Device,
}

impl InputMetadata {
    pub fn new(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        InputMetadata {
            shape,
            dtype,
            device,
        }
    }

    /// Metadata describing `tensor`.
    pub fn of(tensor: &Tensor) -> Self {
        InputMetadata {
            shape: tensor.shape(),
            dtype: tensor.dtype(),
            device: tensor.device(),
        }
    }
}

/// Hook invoked with a node's accumulated gradient inputs before its
/// backward runs; may replace them.
pub trait FunctionPreHook: Debug + Send + Sync {
    fn call(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>, RetrogradError>;
}

/// Hook invoked with a node's outputs (and the inputs it consumed) after its
/// backward ran; may replace the outputs.
pub trait FunctionPostHook: Debug + Send + Sync {
    fn call(
        &self,
        outputs: Vec<Option<Tensor>>,
        inputs: &[Option<Tensor>],
    ) -> Result<Vec<Option<Tensor>>, RetrogradError>;
}

/// Defines the interface for the backward pass of a differentiable operation.
///
/// The engine drives implementations of this trait in reverse topological
/// order: once all of a node's gradient inputs have accumulated, `backward`
/// is invoked exactly once per execution, with one gradient per input slot
/// (`None` marks an undefined gradient). It must return one gradient per
/// outgoing edge, in `next_edges()` order.
///
/// The trait requires `Debug + Send + Sync`: nodes are shared across the
/// engine's worker threads behind `Arc<dyn BackwardOp>`.
pub trait BackwardOp: Debug + Send + Sync {
    /// Computes the gradients of the operation's inputs given the gradients
    /// of its outputs. The returned vector must pair up with `next_edges()`.
    fn backward(&self, grads: Vec<Option<Tensor>>)
        -> Result<Vec<Option<Tensor>>, RetrogradError>;

    /// Edges to this node's successors in the backward graph.
    fn next_edges(&self) -> &[Edge];

    /// Number of gradient input slots (the node's arity).
    fn num_inputs(&self) -> usize;

    /// Expected metadata for gradient input `index`.
    fn input_metadata(&self, index: usize) -> &InputMetadata;

    /// Human-readable name, used in error messages and diagnostics.
    fn name(&self) -> String;

    fn next_edge(&self, index: usize) -> &Edge {
        &self.next_edges()[index]
    }

    /// The stream this node ran on during forward, if any. The engine
    /// switches to it for the duration of `backward` and uses it to order
    /// cross-stream gradient accumulation.
    fn stream(&self) -> Option<Stream> {
        None
    }

    fn pre_hooks(&self) -> &[Arc<dyn FunctionPreHook>] {
        &[]
    }

    fn post_hooks(&self) -> &[Arc<dyn FunctionPostHook>] {
        &[]
    }

    /// Drops saved forward state. Called after `backward` when the caller
    /// did not ask to keep the graph.
    fn release_variables(&self) {}

    /// Advance warning that `release_variables` will be called after the
    /// upcoming `backward`.
    fn will_release_variables(&self) {}
}

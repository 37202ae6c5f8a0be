//! Nodes the engine itself contributes to every graph: the synthetic root
//! that injects the seed gradients, and the leaf sink that accumulates a
//! gradient into a tensor.

use crate::error::RetrogradError;
use crate::tensor::Tensor;

use super::backward_op::{BackwardOp, InputMetadata};
use super::graph::Edge;

/// Synthetic root of a backward invocation.
///
/// Its outgoing edges are the caller's root edges and its backward simply
/// yields the (already validated) seed gradients, one per edge.
#[derive(Debug)]
pub struct GraphRoot {
    outputs: Vec<Option<Tensor>>,
    next: Vec<Edge>,
    input_metadata: Vec<InputMetadata>,
}

impl GraphRoot {
    pub fn new(roots: Vec<Edge>, seeds: Vec<Option<Tensor>>) -> Self {
        GraphRoot {
            outputs: seeds,
            next: roots,
            input_metadata: Vec::new(),
        }
    }
}

impl BackwardOp for GraphRoot {
    fn backward(
        &self,
        _grads: Vec<Option<Tensor>>,
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        Ok(self.outputs.clone())
    }

    fn next_edges(&self) -> &[Edge] {
        &self.next
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn input_metadata(&self, index: usize) -> &InputMetadata {
        // The root has no gradient inputs; indexing is a caller bug.
        &self.input_metadata[index]
    }

    fn name(&self) -> String {
        "GraphRoot".to_string()
    }
}

/// Leaf sink: accumulates the incoming gradient into its variable's `grad`
/// slot.
///
/// Used for graphs executed without explicit capture edges; the caller reads
/// the results off the leaf tensors afterwards.
#[derive(Debug)]
pub struct AccumulateGrad {
    variable: Tensor,
    input_metadata: [InputMetadata; 1],
}

impl AccumulateGrad {
    pub fn new(variable: Tensor) -> Self {
        let input_metadata = [InputMetadata::of(&variable)];
        AccumulateGrad {
            variable,
            input_metadata,
        }
    }

    pub fn variable(&self) -> &Tensor {
        &self.variable
    }
}

impl BackwardOp for AccumulateGrad {
    fn backward(
        &self,
        grads: Vec<Option<Tensor>>,
    ) -> Result<Vec<Option<Tensor>>, RetrogradError> {
        if let Some(grad) = grads.into_iter().next().flatten() {
            self.variable.acc_grad(grad)?;
        }
        Ok(Vec::new())
    }

    fn next_edges(&self) -> &[Edge] {
        &[]
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn input_metadata(&self, index: usize) -> &InputMetadata {
        &self.input_metadata[index]
    }

    fn name(&self) -> String {
        "AccumulateGrad".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;
    use approx::assert_relative_eq;

    #[test]
    fn test_graph_root_yields_seeds_on_its_edges() {
        let seeds = vec![
            Some(Tensor::new_f64(vec![1.0], vec![1]).unwrap()),
            None,
        ];
        let root = GraphRoot::new(vec![Edge::invalid(), Edge::invalid()], seeds);
        assert_eq!(root.num_inputs(), 0);
        assert_eq!(root.next_edges().len(), 2);

        let outputs = root.backward(Vec::new()).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_relative_eq!(
            outputs[0].as_ref().unwrap().to_vec_f64().unwrap().as_slice(),
            [1.0].as_slice()
        );
        assert!(outputs[1].is_none());
    }

    #[test]
    fn test_accumulate_grad_sums_into_variable() {
        let variable = Tensor::zeros(vec![2], DType::F64).unwrap();
        let accumulate = AccumulateGrad::new(variable.clone());
        assert_eq!(accumulate.num_inputs(), 1);
        assert!(accumulate.next_edges().is_empty());

        accumulate
            .backward(vec![Some(Tensor::new_f64(vec![1.0, 2.0], vec![2]).unwrap())])
            .unwrap();
        accumulate
            .backward(vec![Some(Tensor::new_f64(vec![3.0, 4.0], vec![2]).unwrap())])
            .unwrap();
        assert_relative_eq!(
            variable.grad().unwrap().to_vec_f64().unwrap().as_slice(),
            [4.0, 6.0].as_slice()
        );
    }

    #[test]
    fn test_accumulate_grad_ignores_undefined() {
        let variable = Tensor::zeros(vec![1], DType::F32).unwrap();
        let accumulate = AccumulateGrad::new(variable.clone());
        accumulate.backward(vec![None]).unwrap();
        assert!(variable.grad().is_none());
    }
}

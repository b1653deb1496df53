use ndarray::ArrayD;

use crate::graph::{Graph, GraphError, NodeId, TensorRef};
use crate::optimizer::core::OptimizerPass;
use crate::optimizer::result::{OptimizerError, OptimizerResult};
use crate::shape::broadcast_zip;
use crate::weight::WeightRole;

/// Merge two directly connected affine nodes into the first one.
///
/// These show up after [ScaleFactorization](super::ScaleFactorization) inserts a scale node in front of
/// an existing batch normalization, or when the original model already had them back to back.
#[derive(Debug, Clone, Default)]
pub struct AffineFusion;

impl AffineFusion {
    pub fn new() -> Self {
        AffineFusion
    }
}

/// A scale and bias operation, in that order: `scale * x + bias`.
#[derive(Debug, Clone)]
pub struct ScaleBias {
    pub scale: ArrayD<f32>,
    pub bias: ArrayD<f32>,
}

impl ScaleBias {
    fn of(graph: &Graph, node: NodeId) -> Result<ScaleBias, GraphError> {
        Ok(ScaleBias {
            scale: graph.weight(node, WeightRole::Scale)?.data.clone(),
            bias: graph.weight(node, WeightRole::Bias)?.data.clone(),
        })
    }

    /// The single affine operation equal to applying `self` and then `next`:
    /// `s1 * (s0 * x + b0) + b1 = (s0 * s1) * x + (s1 * b0 + b1)`.
    ///
    /// Returns the pair of shapes that failed to broadcast on error.
    pub fn then(&self, next: &ScaleBias) -> Result<ScaleBias, (Vec<usize>, Vec<usize>)> {
        let mismatch = |left: &ArrayD<f32>, right: &ArrayD<f32>| (left.shape().to_vec(), right.shape().to_vec());

        let (s0, b0) = (&self.scale, &self.bias);
        let (s1, b1) = (&next.scale, &next.bias);

        let scale = broadcast_zip(s0, s1, |s0, s1| s0 * s1).ok_or_else(|| mismatch(s0, s1))?;
        let scaled_bias = broadcast_zip(s1, b0, |s1, b0| s1 * b0).ok_or_else(|| mismatch(s1, b0))?;
        let bias = broadcast_zip(&scaled_bias, b1, |sb, b1| sb + b1).ok_or_else(|| mismatch(&scaled_bias, b1))?;

        Ok(ScaleBias { scale, bias })
    }
}

impl OptimizerPass for AffineFusion {
    fn name(&self) -> &str {
        "affine_fusion"
    }

    fn matches(&self, graph: &Graph, node: NodeId) -> bool {
        if !graph[node].kind.is_affine() {
            return false;
        }
        let upstream = match graph.input_node(node) {
            Some(upstream) => upstream,
            None => return false,
        };

        // fusing into an upstream node that has other users would change what those users see
        let upstream_output = graph[node].inputs[0];
        graph[upstream].kind.is_affine()
            && upstream_output == TensorRef::new(upstream, 0)
            && !graph.is_output(upstream_output)
            && graph.consumers(upstream_output) == [node]
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> OptimizerResult<bool> {
        let upstream = match graph.input_node(node) {
            Some(upstream) => upstream,
            None => return Err(GraphError::NotSingleInput(graph[node].name.clone(), graph[node].inputs.len()).into()),
        };

        let first = ScaleBias::of(graph, upstream)?;
        let second = ScaleBias::of(graph, node)?;

        let fused = first
            .then(&second)
            .map_err(|(left, right)| OptimizerError::ShapeMismatch {
                node: graph[node].name.clone(),
                left,
                right,
            })?;

        graph.set_weight(upstream, WeightRole::Scale, fused.scale)?;
        graph.set_weight(upstream, WeightRole::Bias, fused.bias)?;
        graph.remove_node(node, true)?;

        Ok(true)
    }
}

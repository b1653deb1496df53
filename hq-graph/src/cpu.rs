use std::collections::HashMap;

use ndarray::{Array3, Array4, ArrayD, Ix2, Ix3, Ix4};
use thiserror::Error;

use crate::graph::{Graph, LayerKind, Node, NodeId, TensorRef};
use crate::shape::broadcast_zip;
use crate::weight::WeightRole;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("expected {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
    #[error("node `{node}`: {reason}")]
    Shape { node: String, reason: String },
    #[error("node `{node}` is missing its `{role}` weight")]
    MissingWeight { node: String, role: WeightRole },
    #[error("node `{node}` has unsupported activation `{activation}`")]
    UnsupportedActivation { node: String, activation: String },
}

/// Evaluate the graph on the CPU in `f32`, returning the graph outputs in order.
///
/// Weights are used with their hardware encoding undone, see [WeightEntry::decoded](crate::weight::WeightEntry::decoded).
/// Output precisions are ignored, this is a reference of the real-valued computation the graph describes.
pub fn cpu_eval_graph(graph: &Graph, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, CpuError> {
    let input_ids = graph.inputs();
    if input_ids.len() != inputs.len() {
        return Err(CpuError::InputCount {
            expected: input_ids.len(),
            actual: inputs.len(),
        });
    }

    let mut values: HashMap<NodeId, ArrayD<f32>> = HashMap::new();
    let mut next_input = inputs.iter();

    for (id, node) in graph.nodes() {
        let result = match node.kind {
            LayerKind::Input => next_input.next().cloned().unwrap_or_default(),
            _ => {
                let input = operand(node, &values)?;
                eval_node(node, input)?
            }
        };
        values.insert(id, result);
    }

    Ok(graph
        .outputs()
        .iter()
        .map(|output| values[&output.node].clone())
        .collect())
}

fn operand<'a>(node: &Node, values: &'a HashMap<NodeId, ArrayD<f32>>) -> Result<&'a ArrayD<f32>, CpuError> {
    match node.inputs.as_slice() {
        &[TensorRef { node: input, output: 0 }] => Ok(&values[&input]),
        inputs => Err(shape_error(node, format!("expected a single input, got {:?}", inputs))),
    }
}

fn shape_error(node: &Node, reason: impl Into<String>) -> CpuError {
    CpuError::Shape {
        node: node.name.clone(),
        reason: reason.into(),
    }
}

fn weight(node: &Node, role: WeightRole) -> Result<ArrayD<f32>, CpuError> {
    node.weight(role).map(|w| w.decoded()).ok_or_else(|| CpuError::MissingWeight {
        node: node.name.clone(),
        role,
    })
}

fn add_bias(node: &Node, x: ArrayD<f32>) -> Result<ArrayD<f32>, CpuError> {
    match node.weight(WeightRole::Bias) {
        None => Ok(x),
        Some(bias) => broadcast_zip(&x, &bias.decoded(), |x, b| x + b)
            .ok_or_else(|| shape_error(node, "bias does not broadcast to the output")),
    }
}

fn eval_node(node: &Node, x: &ArrayD<f32>) -> Result<ArrayD<f32>, CpuError> {
    let dim_error = |e: ndarray::ShapeError| shape_error(node, e.to_string());

    match node.kind {
        LayerKind::Input => Ok(x.clone()),
        LayerKind::Dense => {
            let w = weight(node, WeightRole::Weight)?.into_dimensionality::<Ix2>().map_err(dim_error)?;
            let x = x.view().into_dimensionality::<Ix2>().map_err(dim_error)?;
            if x.ncols() != w.nrows() {
                return Err(shape_error(node, format!("input {:?} vs weight {:?}", x.shape(), w.shape())));
            }
            add_bias(node, x.dot(&w).into_dyn())
        }
        LayerKind::Conv1D => {
            let w = weight(node, WeightRole::Weight)?.into_dimensionality::<Ix3>().map_err(dim_error)?;
            let x = x.view().into_dimensionality::<Ix3>().map_err(dim_error)?;
            let (batch, width, channels) = x.dim();
            let (k, w_channels, filters) = w.dim();
            if channels != w_channels || width < k {
                return Err(shape_error(node, format!("input {:?} vs kernel {:?}", x.shape(), w.shape())));
            }

            let y = Array3::from_shape_fn((batch, width - k + 1, filters), |(b, i, f)| {
                let mut acc = 0.0;
                for dk in 0..k {
                    for c in 0..channels {
                        acc += x[(b, i + dk, c)] * w[(dk, c, f)];
                    }
                }
                acc
            });
            add_bias(node, y.into_dyn())
        }
        LayerKind::Conv2D => {
            let w = weight(node, WeightRole::Weight)?.into_dimensionality::<Ix4>().map_err(dim_error)?;
            let x = x.view().into_dimensionality::<Ix4>().map_err(dim_error)?;
            let (batch, height, width, channels) = x.dim();
            let (kh, kw, w_channels, filters) = w.dim();
            if channels != w_channels || height < kh || width < kw {
                return Err(shape_error(node, format!("input {:?} vs kernel {:?}", x.shape(), w.shape())));
            }

            let y = Array4::from_shape_fn((batch, height - kh + 1, width - kw + 1, filters), |(b, i, j, f)| {
                let mut acc = 0.0;
                for di in 0..kh {
                    for dj in 0..kw {
                        for c in 0..channels {
                            acc += x[(b, i + di, j + dj, c)] * w[(di, dj, c, f)];
                        }
                    }
                }
                acc
            });
            add_bias(node, y.into_dyn())
        }
        LayerKind::BatchNormalization | LayerKind::ApplyAlpha => {
            let scale = weight(node, WeightRole::Scale)?;
            let scaled =
                broadcast_zip(x, &scale, |x, s| s * x).ok_or_else(|| shape_error(node, "scale does not broadcast"))?;
            add_bias(node, scaled)
        }
        LayerKind::Activation => {
            let activation = node.attr("activation").and_then(|a| a.as_str()).unwrap_or("linear");
            match activation {
                "linear" => Ok(x.clone()),
                "relu" => Ok(x.mapv(|x| x.max(0.0))),
                _ => Err(CpuError::UnsupportedActivation {
                    node: node.name.clone(),
                    activation: activation.to_owned(),
                }),
            }
        }
    }
}


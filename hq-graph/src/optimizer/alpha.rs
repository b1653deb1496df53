use indexmap::IndexMap;
use ndarray::{Array1, ArrayD, Zip};

use crate::graph::{AttrValue, Graph, GraphError, LayerKind, Node, NodeId, TensorRef};
use crate::optimizer::core::OptimizerPass;
use crate::optimizer::result::{OptimizerError, OptimizerResult};
use crate::precision::PrecisionType;
use crate::quantizer::{Alpha, Quantized, Quantizer};
use crate::shape::broadcast_zip;
use crate::weight::{WeightEntry, WeightRole};

pub const WEIGHT_QUANTIZER: &str = "weight_quantizer";
pub const BIAS_QUANTIZER: &str = "bias_quantizer";

/// Appended to the layer name to get the name of the inserted [LayerKind::ApplyAlpha] node.
pub const ALPHA_SUFFIX: &str = "_alpha";

/// The bias and scale precision of inserted [LayerKind::ApplyAlpha] nodes.
///
/// This is a fixed guess, not derived from the actual scale values.
pub fn alpha_placeholder_precision() -> PrecisionType {
    PrecisionType::fixed(16, 6)
}

/// Move the scale factor (alpha) of a quantized dense or convolution layer out of its weights.
///
/// The weights are stored at unit scale, the common representation of the hardware type,
/// and a [LayerKind::ApplyAlpha] node is inserted behind the layer to multiply the scale back in.
/// Consecutive affine nodes created this way are cleaned up by [AffineFusion](super::AffineFusion).
#[derive(Debug, Clone, Default)]
pub struct ScaleFactorization;

impl ScaleFactorization {
    pub fn new() -> Self {
        ScaleFactorization
    }
}

fn has_scaling_alpha(node: &Node, key: &str) -> bool {
    node.attr(key)
        .and_then(AttrValue::as_quantizer)
        .map_or(false, |quantizer| !quantizer.has_unit_alpha())
}

impl OptimizerPass for ScaleFactorization {
    fn name(&self) -> &str {
        "scale_factorization"
    }

    fn matches(&self, graph: &Graph, node: NodeId) -> bool {
        let node = &graph[node];
        node.kind.has_weighted_inputs()
            && (has_scaling_alpha(node, WEIGHT_QUANTIZER) || has_scaling_alpha(node, BIAS_QUANTIZER))
    }

    fn transform(&self, graph: &mut Graph, id: NodeId) -> OptimizerResult<bool> {
        let name = graph[id].name.clone();
        let missing = |what| OptimizerError::MissingQuantizerData {
            node: name.clone(),
            what,
        };

        // re-quantize the weights at unit scale
        let scale = {
            let WeightEntry {
                data,
                data_unquantized,
                quantizer,
            } = graph
                .weight_mut(id, WeightRole::Weight)
                .map_err(|_| missing("weight tensor"))?;

            let unquantized = data_unquantized.as_ref().ok_or_else(|| missing("unquantized weights"))?;
            let quantizer = quantizer.as_mut().ok_or_else(|| missing("weight quantizer"))?;

            // quantize the original weights, the stored data has already been quantized once
            let Quantized { values, scale } = quantizer.function.quantize(unquantized);

            let mut unscaled = values;
            Zip::from(&mut unscaled)
                .and_broadcast(&scale)
                .for_each(|v, &s| *v *= 1.0 / s);

            let config = quantizer.function.config().with_alpha(Alpha::one());
            quantizer.function = Quantizer::from_config(config);

            // binary weights are only encoded correctly after the hardware quantizer is applied again
            *data = quantizer.apply(&unscaled);

            scale
        };

        // one scale per output channel, which is the last axis of the layer output
        let scale: ArrayD<f32> = Array1::from_iter(scale.iter().copied()).into_dyn();

        rescale_bias(graph, id, &name, &scale)?;

        let node = graph.node_mut(id)?;
        for key in [WEIGHT_QUANTIZER, BIAS_QUANTIZER] {
            if let Some(quantizer) = node.attrs.get_mut(key).and_then(AttrValue::as_quantizer_mut) {
                if quantizer.alpha.is_some() {
                    quantizer.alpha = Some(Alpha::one());
                }
            }
        }

        let alpha_node = build_alpha_node(graph, id, scale)?;
        graph.insert_node(alpha_node)?;

        Ok(true)
    }
}

/// Divide the bias by the extracted scale, so `scale * (w·x + b / scale)` still equals the original `w_q·x + b`.
fn rescale_bias(graph: &mut Graph, id: NodeId, name: &str, scale: &ArrayD<f32>) -> OptimizerResult<()> {
    let node = graph.node_mut(id)?;
    let bias = match node.weights.get_mut(&WeightRole::Bias) {
        Some(bias) => bias,
        None => return Ok(()),
    };

    let divide = |data: &ArrayD<f32>| {
        broadcast_zip(data, scale, |b, s| b / s)
            .filter(|result| result.shape() == data.shape())
            .ok_or_else(|| OptimizerError::ShapeMismatch {
                node: name.to_owned(),
                left: data.shape().to_vec(),
                right: scale.shape().to_vec(),
            })
    };

    bias.data = divide(&bias.data)?;
    if let Some(unquantized) = &bias.data_unquantized {
        bias.data_unquantized = Some(divide(unquantized)?);
    }

    Ok(())
}

fn build_alpha_node(graph: &Graph, id: NodeId, scale: ArrayD<f32>) -> OptimizerResult<Node> {
    let node = graph.node(id)?;
    let output = match node.outputs.first() {
        Some(output) => output,
        None => return Err(GraphError::MissingOutput(node.name.clone()).into()),
    };

    let n_out = match node.attr("n_out").and_then(AttrValue::as_int) {
        Some(n_out) => n_out,
        None => output.shape.last().copied().unwrap_or(1) as i64,
    };
    let n_filt = node.attr("n_filt").and_then(AttrValue::as_int).unwrap_or(-1);

    let mut attrs = IndexMap::new();
    attrs.insert("n_in".to_owned(), AttrValue::Int(n_out));
    attrs.insert("n_filt".to_owned(), AttrValue::Int(n_filt));
    if let Some(reuse_factor) = node.attr("reuse_factor") {
        attrs.insert("reuse_factor".to_owned(), reuse_factor.clone());
    }
    attrs.insert("bias_t".to_owned(), AttrValue::Precision(alpha_placeholder_precision()));
    attrs.insert("scale_t".to_owned(), AttrValue::Precision(alpha_placeholder_precision()));

    let bias = ArrayD::zeros(scale.raw_dim());

    let alpha_node = graph
        .make_node(
            LayerKind::ApplyAlpha,
            format!("{}{}", node.name, ALPHA_SUFFIX),
            attrs,
            vec![TensorRef::new(id, 0)],
            output.shape.clone(),
            output.precision.clone(),
        )
        .with_weight(WeightRole::Scale, WeightEntry::new(scale))
        .with_weight(WeightRole::Bias, WeightEntry::new(bias));

    Ok(alpha_node)
}

use indexmap::IndexSet;

use crate::graph::{AttrValue, Graph, NodeId};
use crate::optimizer::core::OptimizerPass;
use crate::optimizer::result::{OptimizerError, OptimizerResult};
use crate::precision::{QuantModes, RoundingMode, SaturationMode};

/// The attribute holding the accumulator precision of layers that have one.
pub const ACCUM_T: &str = "accum_t";

/// Which layers get which output rounding and saturation.
///
/// `layers` holds layer class names (eg. `"Dense"`) and layer names.
/// The default selects no layers at all.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RoundingSaturationConfig {
    pub layers: IndexSet<String>,
    pub rounding: Option<RoundingMode>,
    pub saturation: Option<SaturationMode>,
    pub saturation_bits: Option<u32>,
}

impl RoundingSaturationConfig {
    pub fn new(layers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        RoundingSaturationConfig {
            layers: layers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn rounding(self, rounding: RoundingMode) -> Self {
        RoundingSaturationConfig {
            rounding: Some(rounding),
            ..self
        }
    }

    pub fn saturation(self, saturation: SaturationMode) -> Self {
        RoundingSaturationConfig {
            saturation: Some(saturation),
            ..self
        }
    }

    pub fn saturation_bits(self, bits: u32) -> Self {
        RoundingSaturationConfig {
            saturation_bits: Some(bits),
            ..self
        }
    }

    pub fn modes(&self) -> QuantModes {
        QuantModes {
            rounding: self.rounding,
            saturation: self.saturation,
            saturation_bits: self.saturation_bits,
        }
    }
}

/// Set the rounding and saturation mode of the output (and accumulator, if any) of the selected layers.
///
/// Only the configured modes are written, everything else about the precision stays as it was.
#[derive(Debug, Clone)]
pub struct OutputRoundingSaturationMode {
    config: RoundingSaturationConfig,
}

impl OutputRoundingSaturationMode {
    pub fn new(config: RoundingSaturationConfig) -> Self {
        OutputRoundingSaturationMode { config }
    }

    pub fn config(&self) -> &RoundingSaturationConfig {
        &self.config
    }
}

impl OptimizerPass for OutputRoundingSaturationMode {
    fn name(&self) -> &str {
        "output_rounding_saturation_mode"
    }

    fn matches(&self, graph: &Graph, node: NodeId) -> bool {
        let node = &graph[node];
        let layers = &self.config.layers;
        if !layers.contains(node.kind.name()) && !layers.contains(&node.name) {
            return false;
        }

        let modes = self.config.modes();
        if modes.is_empty() {
            return false;
        }

        node.outputs
            .first()
            .map_or(false, |output| !output.precision.carries(&modes))
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> OptimizerResult<bool> {
        let old = graph.output_precision(node)?;
        let new = old
            .with_modes(&self.config.modes())
            .map_err(|source| OptimizerError::PrecisionMismatch {
                node: graph[node].name.clone(),
                source,
            })?;

        if graph.attr(node, ACCUM_T).is_some() {
            graph.set_attr(node, ACCUM_T, AttrValue::Precision(new.clone()))?;
        }
        graph.set_output_precision(node, new)?;

        Ok(false)
    }
}

use std::fmt::{Display, Formatter};

use ndarray::ArrayD;

use crate::quantizer::WeightQuantizer;

/// The role a weight tensor plays in its layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WeightRole {
    Weight,
    Bias,
    Scale,
}

/// A weight tensor stored on a node.
///
/// If `quantizer` is set, `data` is already quantized and encoded. `data_unquantized` is the value
/// before any quantization, and is what a quantizer must be re-applied to.
#[derive(Debug, Clone)]
pub struct WeightEntry {
    pub data: ArrayD<f32>,
    pub data_unquantized: Option<ArrayD<f32>>,
    pub quantizer: Option<WeightQuantizer>,
}

impl WeightRole {
    pub const ALL: &'static [Self] = &[WeightRole::Weight, WeightRole::Bias, WeightRole::Scale];

    pub fn name(self) -> &'static str {
        match self {
            WeightRole::Weight => "weight",
            WeightRole::Bias => "bias",
            WeightRole::Scale => "scale",
        }
    }
}

impl WeightEntry {
    pub fn new(data: ArrayD<f32>) -> Self {
        WeightEntry {
            data,
            data_unquantized: None,
            quantizer: None,
        }
    }

    /// Quantize and encode `unquantized`, keeping the original around.
    pub fn quantized(unquantized: ArrayD<f32>, quantizer: WeightQuantizer) -> Self {
        let values = quantizer.function.quantize(&unquantized).values;
        WeightEntry {
            data: quantizer.apply(&values),
            data_unquantized: Some(unquantized),
            quantizer: Some(quantizer),
        }
    }

    /// The arithmetic value of `data`, undoing the hardware encoding if there is one.
    pub fn decoded(&self) -> ArrayD<f32> {
        match &self.quantizer {
            Some(quantizer) => quantizer.encoding.decode(&self.data),
            None => self.data.clone(),
        }
    }
}

impl Display for WeightRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

use decorum::Total;
use ndarray::{ArrayD, Axis, IxDyn, Zip};

/// The scale factor a quantizer applies before mapping values onto its levels.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Alpha {
    /// The same scale for every element.
    Fixed(Total<f32>),
    /// A scale per output channel, chosen so the largest magnitude in the channel hits the largest level.
    Auto,
    /// Like [Alpha::Auto], rounded to the nearest power of two.
    AutoPo2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QuantizerKind {
    /// Fixed-point levels with `bits` total bits of which `integer` are integer bits, excluding the sign bit.
    Bits { bits: u32, integer: u32, keep_negative: bool },
    /// Levels `{-1, 1}`.
    Binary,
    /// Levels `{-1, 0, 1}`.
    Ternary,
}

/// Everything needed to rebuild a [Quantizer].
///
/// `alpha` is `None` for quantizers that don't have a scale factor at all, these behave as if `alpha == 1`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct QuantizerConfig {
    pub kind: QuantizerKind,
    pub alpha: Option<Alpha>,
}

/// A training-time quantizer, a pure function from a full precision tensor to a quantized one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Quantizer {
    config: QuantizerConfig,
}

/// The result of [Quantizer::quantize].
///
/// `scale` has the same rank as the input, with every axis except the last (the output channels) of size 1.
#[derive(Debug, Clone)]
pub struct Quantized {
    pub values: ArrayD<f32>,
    pub scale: ArrayD<f32>,
}

/// How quantized values are stored in the hardware numeric type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Encoding {
    /// Values are stored as they are.
    Native,
    /// With `bits == 1`, `-1` is stored as `0`. With `bits == 2` the values are `{-1, 1}`.
    Binary { bits: u32 },
    /// Values are stored as `{-1, 0, 1}`.
    Ternary,
}

/// The quantizer attached to a weight: the training quantizer and the hardware encoding of its output.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WeightQuantizer {
    pub function: Quantizer,
    pub encoding: Encoding,
}

impl Alpha {
    pub fn one() -> Alpha {
        Alpha::fixed(1.0)
    }

    pub fn fixed(alpha: f32) -> Alpha {
        Alpha::Fixed(Total::from_inner(alpha))
    }

    pub fn is_one(self) -> bool {
        match self {
            Alpha::Fixed(alpha) => alpha.into_inner() == 1.0,
            Alpha::Auto | Alpha::AutoPo2 => false,
        }
    }
}

impl QuantizerKind {
    /// The largest positive level, used to derive automatic scales.
    fn max_level(self) -> f32 {
        match self {
            QuantizerKind::Bits { .. } => {
                let (_, max) = self.bounds();
                max
            }
            QuantizerKind::Binary | QuantizerKind::Ternary => 1.0,
        }
    }

    fn step(self) -> f32 {
        match self {
            QuantizerKind::Bits {
                bits,
                integer,
                keep_negative,
            } => {
                let fractional = bits as i32 - integer as i32 - keep_negative as i32;
                2f32.powi(-fractional)
            }
            QuantizerKind::Binary | QuantizerKind::Ternary => 1.0,
        }
    }

    fn bounds(self) -> (f32, f32) {
        match self {
            QuantizerKind::Bits {
                integer, keep_negative, ..
            } => {
                let range = 2f32.powi(integer as i32);
                let min = if keep_negative { -range } else { 0.0 };
                (min, range - self.step())
            }
            QuantizerKind::Binary | QuantizerKind::Ternary => (-1.0, 1.0),
        }
    }

    fn level(self, x: f32) -> f32 {
        match self {
            QuantizerKind::Bits { .. } => {
                let step = self.step();
                let (min, max) = self.bounds();
                ((x / step).round() * step).clamp(min, max)
            }
            QuantizerKind::Binary => {
                if x >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
            QuantizerKind::Ternary => {
                if x.abs() < 0.5 {
                    0.0
                } else {
                    x.signum()
                }
            }
        }
    }
}

impl QuantizerConfig {
    pub fn bits(bits: u32, integer: u32, keep_negative: bool) -> Self {
        QuantizerConfig {
            kind: QuantizerKind::Bits {
                bits,
                integer,
                keep_negative,
            },
            alpha: Some(Alpha::one()),
        }
    }

    pub fn binary() -> Self {
        QuantizerConfig {
            kind: QuantizerKind::Binary,
            alpha: Some(Alpha::one()),
        }
    }

    pub fn ternary() -> Self {
        QuantizerConfig {
            kind: QuantizerKind::Ternary,
            alpha: Some(Alpha::one()),
        }
    }

    pub fn with_alpha(self, alpha: Alpha) -> Self {
        QuantizerConfig {
            alpha: Some(alpha),
            ..self
        }
    }

    pub fn without_alpha(self) -> Self {
        QuantizerConfig { alpha: None, ..self }
    }

    pub fn has_unit_alpha(&self) -> bool {
        self.alpha.map_or(true, Alpha::is_one)
    }
}

impl Quantizer {
    pub fn from_config(config: QuantizerConfig) -> Self {
        Quantizer { config }
    }

    pub fn config(&self) -> QuantizerConfig {
        self.config
    }

    pub fn quantize(&self, data: &ArrayD<f32>) -> Quantized {
        let kind = self.config.kind;
        let scale = self.scale(data);

        let mut values = data.clone();
        Zip::from(&mut values)
            .and_broadcast(&scale)
            .for_each(|v, &s| *v = s * kind.level(*v / s));

        Quantized { values, scale }
    }

    fn scale(&self, data: &ArrayD<f32>) -> ArrayD<f32> {
        let rank = data.ndim();
        let channels = data.shape().last().copied().unwrap_or(1);

        let mut scale_shape = vec![1; rank];
        if let Some(last) = scale_shape.last_mut() {
            *last = channels;
        }

        let alpha = self.config.alpha.unwrap_or_else(Alpha::one);
        let per_channel = |po2: bool| {
            let max_level = self.config.kind.max_level();
            let mut scale = ArrayD::from_elem(IxDyn(&scale_shape), 1.0);

            for (c, s) in scale.iter_mut().enumerate() {
                let max_abs = if rank == 0 {
                    data.iter().fold(0f32, |acc, &x| acc.max(x.abs()))
                } else {
                    data.index_axis(Axis(rank - 1), c)
                        .fold(0f32, |acc, &x| acc.max(x.abs()))
                };

                // all-zero channels keep a unit scale
                if max_abs > 0.0 {
                    let raw = max_abs / max_level;
                    *s = if po2 { 2f32.powf(raw.log2().round()) } else { raw };
                }
            }
            scale
        };

        match alpha {
            Alpha::Fixed(alpha) => ArrayD::from_elem(IxDyn(&vec![1; rank]), alpha.into_inner()),
            Alpha::Auto => per_channel(false),
            Alpha::AutoPo2 => per_channel(true),
        }
    }
}

impl Encoding {
    pub fn encode(self, data: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Encoding::Native => data.clone(),
            Encoding::Binary { bits: 1 } => data.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 }),
            Encoding::Binary { .. } => data.mapv(|x| if x > 0.0 { 1.0 } else { -1.0 }),
            Encoding::Ternary => data.mapv(|x| {
                if x >= 0.5 {
                    1.0
                } else if x <= -0.5 {
                    -1.0
                } else {
                    0.0
                }
            }),
        }
    }

    /// The arithmetic value of encoded data, the inverse of [Encoding::encode] on quantized levels.
    pub fn decode(self, data: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Encoding::Binary { bits: 1 } => data.mapv(|x| if x > 0.0 { 1.0 } else { -1.0 }),
            Encoding::Native | Encoding::Binary { .. } | Encoding::Ternary => data.clone(),
        }
    }
}

impl WeightQuantizer {
    pub fn new(config: QuantizerConfig, encoding: Encoding) -> Self {
        WeightQuantizer {
            function: Quantizer::from_config(config),
            encoding,
        }
    }

    /// Apply the hardware encoding to already quantized values.
    pub fn apply(&self, data: &ArrayD<f32>) -> ArrayD<f32> {
        self.encoding.encode(data)
    }
}

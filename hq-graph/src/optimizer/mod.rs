use crate::graph::Graph;

pub use self::affine::{AffineFusion, ScaleBias};
pub use self::alpha::{alpha_placeholder_precision, ScaleFactorization, ALPHA_SUFFIX, BIAS_QUANTIZER, WEIGHT_QUANTIZER};
pub use self::core::{OptimizeReport, Optimizer, OptimizerPass};
pub use self::result::{OptimizerError, OptimizerResult};
pub use self::rounding::{OutputRoundingSaturationMode, RoundingSaturationConfig, ACCUM_T};

mod affine;
mod alpha;
mod core;
mod result;
mod rounding;

/// Settings for the optimizer.
///
/// Use `Default::default()` to get reasonable defaults.
#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// If `false`, don't do any optimization at all.
    pub optimize: bool,
    /// The maximum number of scans over the graph before giving up on reaching a fixpoint.
    /// `None` means no limit.
    ///
    /// Every transform that changes the topology restarts the scan, and restarts count towards this limit.
    /// The default pipeline needs about two scans per quantized layer with a scale factor, so very large
    /// models may need a higher limit.
    pub max_iterations: Option<usize>,
    /// Which layers get an explicit output rounding and saturation mode, by default none.
    pub rounding: RoundingSaturationConfig,
}

impl Optimizer {
    /// The standard pass pipeline: scale factorization, affine fusion, then output rounding and saturation.
    pub fn with_default_passes(settings: &OptimizerSettings) -> Self {
        let mut optimizer = Optimizer::new(settings.max_iterations);
        optimizer
            .register(ScaleFactorization::new())
            .register(AffineFusion::new())
            .register(OutputRoundingSaturationMode::new(settings.rounding.clone()));
        optimizer
    }
}

/// Optimize the given graph in place according to the given settings.
///
/// On error the graph is left partially rewritten and must not be used for code generation.
pub fn optimize_graph(graph: &mut Graph, settings: &OptimizerSettings) -> OptimizerResult<OptimizeReport> {
    if !settings.optimize {
        return Ok(OptimizeReport {
            scans: 0,
            transforms: 0,
            converged: true,
        });
    }

    Optimizer::with_default_passes(settings).run(graph)
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            optimize: true,
            max_iterations: Some(1000),
            rounding: RoundingSaturationConfig::default(),
        }
    }
}

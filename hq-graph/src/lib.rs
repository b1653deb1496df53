#![warn(missing_debug_implementations)]
#![allow(clippy::new_without_default)]

//! Rule-based rewriting of quantized neural network graphs, ahead of fixed-point hardware code generation.
//!
//! The core type of this crate is [Graph](graph::Graph), a layer graph where every output carries the
//! [PrecisionType](precision::PrecisionType) it will have in hardware. The [optimizer] rewrites such graphs
//! with a fixpoint loop over a list of passes:
//! * [ScaleFactorization](optimizer::ScaleFactorization) moves per-tensor quantizer scales out of the weights
//!   into an explicit `ApplyAlpha` node,
//! * [AffineFusion](optimizer::AffineFusion) merges consecutive scale-and-bias nodes,
//! * [OutputRoundingSaturationMode](optimizer::OutputRoundingSaturationMode) sets the rounding and saturation
//!   mode of selected layer outputs.
//!
//! ```
//! # use hq_graph::graph::*;
//! # use hq_graph::precision::{PrecisionType, RoundingMode};
//! # use hq_graph::optimizer::{optimize_graph, OptimizerSettings, RoundingSaturationConfig};
//! # use indexmap::IndexMap;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = Graph::new();
//! let x = graph.input("x", vec![1, 8], PrecisionType::fixed(16, 6));
//! let relu = graph.make_node(LayerKind::Activation, "relu", IndexMap::new(), vec![TensorRef::new(x, 0)], vec![1, 8], PrecisionType::fixed(16, 6));
//! let relu = graph.push_node(relu)?;
//! graph.output(TensorRef::new(relu, 0));
//!
//! let settings = OptimizerSettings {
//!     rounding: RoundingSaturationConfig::new(["Activation"]).rounding(RoundingMode::RndConv),
//!     ..Default::default()
//! };
//! optimize_graph(&mut graph, &settings)?;
//!
//! assert_eq!(graph.output_precision(relu)?.to_string(), "fixed<16,6,RND_CONV>");
//! # Ok(())
//! # }
//! ```

/// The [ndarray] crate is used for weight storage and CPU evaluation, and re-exported for convenience.
pub use ndarray;

/// The core graph datastructure.
pub mod graph;
/// Graph optimization.
pub mod optimizer;
/// Hardware numeric types.
pub mod precision;
/// Training-time quantizers and hardware weight encodings.
pub mod quantizer;
/// Broadcasting utilities.
pub mod shape;
/// Weight tensors attached to nodes.
pub mod weight;

/// CPU graph evaluation.
pub mod cpu;
/// Code generation template registration.
pub mod templates;

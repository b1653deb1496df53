use rand::rngs::StdRng;
use rand::SeedableRng;

use hq_graph::graph::{AttrValue, Graph, NodeId, TensorRef};
use hq_graph::optimizer::{
    optimize_graph, OptimizerError, OptimizerPass, OptimizerSettings, OutputRoundingSaturationMode,
    RoundingSaturationConfig, ACCUM_T,
};
use hq_graph::precision::{PrecisionError, PrecisionType, RoundingMode, SaturationMode};
use hq_graph::quantizer::{Encoding, QuantizerConfig};

use crate::root::models::{activation, quantized_dense};
use crate::root::tensor_utils::rng_tensor;

fn relu_graph() -> (Graph, NodeId) {
    let mut graph = Graph::new();
    let x = graph.input("x", vec![1, 4], PrecisionType::fixed(16, 6));
    let relu = activation(&mut graph, x, "relu", "relu");
    graph.output(TensorRef::new(relu, 0));
    (graph, relu)
}

#[test]
fn set_rounding_once() {
    let (mut graph, relu) = relu_graph();
    let pass = OutputRoundingSaturationMode::new(RoundingSaturationConfig::new(["Activation"]).rounding(RoundingMode::RndConv));

    assert!(pass.matches(&graph, relu));
    assert!(!pass.transform(&mut graph, relu).unwrap());
    assert_eq!(graph.output_precision(relu).unwrap().to_string(), "fixed<16,6,RND_CONV>");

    assert!(!pass.matches(&graph, relu));
}

#[test]
fn unselected_layers_untouched() {
    let (graph, relu) = relu_graph();
    let x = graph.inputs()[0];

    let by_other_name = OutputRoundingSaturationMode::new(RoundingSaturationConfig::new(["Dense", "relu2"]).rounding(RoundingMode::RndConv));
    assert!(!by_other_name.matches(&graph, relu));
    assert!(!by_other_name.matches(&graph, x));

    // selected, but nothing to set
    let empty = OutputRoundingSaturationMode::new(RoundingSaturationConfig::new(["relu"]));
    assert!(!empty.matches(&graph, relu));

    let by_name = OutputRoundingSaturationMode::new(RoundingSaturationConfig::new(["relu"]).saturation(SaturationMode::Sat));
    assert!(by_name.matches(&graph, relu));
}

#[test]
fn keeps_existing_modes() {
    let (mut graph, relu) = relu_graph();
    graph
        .set_output_precision(relu, "fixed<16,6,TRN,SAT_SYM>".parse().unwrap())
        .unwrap();

    let pass = OutputRoundingSaturationMode::new(RoundingSaturationConfig::new(["relu"]).rounding(RoundingMode::RndConv));
    pass.transform(&mut graph, relu).unwrap();

    assert_eq!(graph.output_precision(relu).unwrap().to_string(), "fixed<16,6,RND_CONV,SAT_SYM>");
}

#[test]
fn accumulator_follows_output() {
    let mut rng = StdRng::seed_from_u64(0);
    let mut graph = Graph::new();
    let x = graph.input("x", vec![1, 3], PrecisionType::fixed(16, 6));
    let dense = quantized_dense(
        &mut graph,
        x,
        "dense",
        rng_tensor(&[3, 2], &mut rng),
        None,
        QuantizerConfig::bits(6, 0, true),
        Encoding::Native,
    );
    graph.set_attr(dense, ACCUM_T, AttrValue::Precision(PrecisionType::fixed(32, 12))).unwrap();
    graph.output(TensorRef::new(dense, 0));

    let settings = OptimizerSettings {
        rounding: RoundingSaturationConfig::new(["Dense"])
            .rounding(RoundingMode::RndConv)
            .saturation(SaturationMode::Sat)
            .saturation_bits(1),
        ..Default::default()
    };
    let report = optimize_graph(&mut graph, &settings).unwrap();

    let expected = "fixed<16,6,RND_CONV,SAT,1>";
    assert_eq!(graph.output_precision(dense).unwrap().to_string(), expected);
    let accum = graph.attr(dense, ACCUM_T).and_then(AttrValue::as_precision).unwrap();
    assert_eq!(accum.to_string(), expected);

    assert!(report.converged);
    assert_eq!(report.transforms, 1);
    assert_eq!(report.scans, 2);
}

#[test]
fn text_precision() {
    let (mut graph, relu) = relu_graph();
    graph.set_output_precision(relu, PrecisionType::text("ap_fixed<16,6>")).unwrap();

    let config = RoundingSaturationConfig::new(["relu"])
        .rounding(RoundingMode::RndConv)
        .saturation(SaturationMode::Sat);
    let pass = OutputRoundingSaturationMode::new(config);

    assert!(pass.matches(&graph, relu));
    pass.transform(&mut graph, relu).unwrap();
    assert_eq!(
        graph.output_precision(relu).unwrap(),
        &PrecisionType::text("ap_fixed<16,6,AP_RND_CONV,AP_SAT>")
    );
    assert!(!pass.matches(&graph, relu));
}

#[test]
fn unrecognized_text_precision() {
    let (mut graph, relu) = relu_graph();
    graph.set_output_precision(relu, PrecisionType::text("float")).unwrap();

    let settings = OptimizerSettings {
        rounding: RoundingSaturationConfig::new(["relu"]).rounding(RoundingMode::RndConv),
        ..Default::default()
    };
    let result = optimize_graph(&mut graph, &settings);

    match result {
        Err(OptimizerError::PrecisionMismatch {
            node,
            source: PrecisionError::Unrecognized(text),
        }) => {
            assert_eq!(node, "relu");
            assert_eq!(text, "float");
        }
        other => panic!("Expected a precision mismatch, got {:?}", other),
    }
    assert_eq!(graph.output_precision(relu).unwrap(), &PrecisionType::text("float"));
}

use std::error::Error;

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::Level;

use hq_graph::cpu::cpu_eval_graph;
use hq_graph::graph::{AttrValue, Graph, LayerKind, TensorRef};
use hq_graph::optimizer::{optimize_graph, OptimizerSettings, RoundingSaturationConfig, WEIGHT_QUANTIZER};
use hq_graph::precision::{PrecisionType, RoundingMode, SaturationMode};
use hq_graph::quantizer::{Alpha, Encoding, QuantizerConfig, WeightQuantizer};
use hq_graph::templates::TemplateRegistry;
use hq_graph::weight::{WeightEntry, WeightRole};

/// Build a small quantized dense -> batchnorm -> relu model, optimize it and check that its output did not change.
fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let (n_in, n_out) = (6, 4);
    let mut rng = StdRng::seed_from_u64(0);
    let mut random = |shape: &[usize]| ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-1.0f32..1.0));

    let precision = PrecisionType::fixed(16, 6);
    let mut graph = Graph::new();
    let x = graph.input("x", vec![1, n_in], precision.clone());

    let quantizer = QuantizerConfig::bits(4, 0, true).with_alpha(Alpha::Auto);
    let mut attrs = IndexMap::new();
    attrs.insert("n_in".to_owned(), AttrValue::Int(n_in as i64));
    attrs.insert("n_out".to_owned(), AttrValue::Int(n_out as i64));
    attrs.insert(WEIGHT_QUANTIZER.to_owned(), AttrValue::Quantizer(quantizer));
    attrs.insert("accum_t".to_owned(), AttrValue::Precision(PrecisionType::fixed(24, 12)));

    let dense = graph
        .make_node(
            LayerKind::Dense,
            "dense",
            attrs,
            vec![TensorRef::new(x, 0)],
            vec![1, n_out],
            precision.clone(),
        )
        .with_weight(
            WeightRole::Weight,
            WeightEntry::quantized(random(&[n_in, n_out]), WeightQuantizer::new(quantizer, Encoding::Native)),
        )
        .with_weight(WeightRole::Bias, WeightEntry::new(random(&[n_out])));
    let dense = graph.push_node(dense)?;

    let bn = graph
        .make_node(
            LayerKind::BatchNormalization,
            "bn",
            IndexMap::new(),
            vec![TensorRef::new(dense, 0)],
            vec![1, n_out],
            precision.clone(),
        )
        .with_weight(WeightRole::Scale, WeightEntry::new(random(&[n_out])))
        .with_weight(WeightRole::Bias, WeightEntry::new(random(&[n_out])));
    let bn = graph.push_node(bn)?;

    let relu = graph
        .make_node(
            LayerKind::Activation,
            "relu",
            IndexMap::new(),
            vec![TensorRef::new(bn, 0)],
            vec![1, n_out],
            precision,
        )
        .with_attr("activation", AttrValue::Str("relu".to_owned()));
    let relu = graph.push_node(relu)?;
    graph.output(TensorRef::new(relu, 0));

    println!("Raw graph:");
    println!("{}", graph);

    let input = random(&[1, n_in]);
    let before = cpu_eval_graph(&graph, &[input.clone()])?;

    let settings = OptimizerSettings {
        rounding: RoundingSaturationConfig::new(["Dense", "relu"])
            .rounding(RoundingMode::RndConv)
            .saturation(SaturationMode::Sat),
        ..Default::default()
    };
    let report = optimize_graph(&mut graph, &settings)?;

    println!("Optimized graph ({:?}):", report);
    println!("{}", graph);

    let templates = TemplateRegistry::default();
    for (_, node) in graph.nodes() {
        if let Some(t) = templates.get(node.kind) {
            println!("{} `{}` -> {} / {}", node.kind, node.name, t.function, t.config);
        }
    }

    let after = cpu_eval_graph(&graph, &[input])?;
    let max_error = before[0]
        .iter()
        .zip(after[0].iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0f32, f32::max);
    println!("Max output difference: {}", max_error);

    Ok(())
}

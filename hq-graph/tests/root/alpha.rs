use rand::rngs::StdRng;
use rand::SeedableRng;

use hq_graph::cpu::cpu_eval_graph;
use hq_graph::graph::{AttrValue, Graph, LayerKind, TensorRef};
use hq_graph::ndarray::{Array2, ArrayD, Axis, Ix2};
use hq_graph::optimizer::{
    alpha_placeholder_precision, optimize_graph, OptimizerError, OptimizerPass, OptimizerSettings, ScaleFactorization,
    BIAS_QUANTIZER, WEIGHT_QUANTIZER,
};
use hq_graph::precision::PrecisionType;
use hq_graph::quantizer::{Alpha, Encoding, QuantizerConfig};
use hq_graph::weight::{WeightEntry, WeightRole};

use crate::root::models::{batchnorm, quantized_conv1d, quantized_conv2d, quantized_dense};
use crate::root::runner::test_optimized;
use crate::root::tensor_utils::{assert_tensors_match, rng_tensor};

#[test]
fn dense_auto_alpha() {
    let mut rng = StdRng::seed_from_u64(0);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![2, 5], PrecisionType::fixed(16, 6));
    let quantizer = QuantizerConfig::bits(4, 0, true).with_alpha(Alpha::Auto);
    let dense = quantized_dense(
        &mut graph,
        x,
        "dense",
        rng_tensor(&[5, 3], &mut rng),
        Some(rng_tensor(&[3], &mut rng)),
        quantizer,
        Encoding::Native,
    );
    graph.output(TensorRef::new(dense, 0));

    assert!(ScaleFactorization::new().matches(&graph, dense));

    let input = rng_tensor(&[2, 5], &mut rng);
    let (optimized, report) = test_optimized(&graph, &OptimizerSettings::default(), &[input]);
    assert_eq!(report.transforms, 1);
    assert_eq!(report.scans, 2);

    let alpha = optimized.find_node("dense_alpha").unwrap();
    let node = &optimized[alpha];
    assert_eq!(node.kind, LayerKind::ApplyAlpha);
    assert_eq!(node.inputs, vec![TensorRef::new(dense, 0)]);
    assert_eq!(node.outputs[0].shape, vec![2, 3]);
    assert_eq!(node.outputs[0].precision, PrecisionType::fixed(16, 6));
    assert_eq!(node.attr("n_in").and_then(AttrValue::as_int), Some(3));
    assert_eq!(node.attr("reuse_factor").and_then(AttrValue::as_int), Some(1));
    assert_eq!(
        node.attr("scale_t").and_then(AttrValue::as_precision),
        Some(&alpha_placeholder_precision())
    );
    assert_eq!(node.weight(WeightRole::Bias).unwrap().data, ArrayD::zeros(vec![3]));

    assert_eq!(optimized.consumers(TensorRef::new(dense, 0)), vec![alpha]);
    assert_eq!(optimized.outputs(), &[TensorRef::new(alpha, 0)]);

    let quantizer = optimized.attr(dense, WEIGHT_QUANTIZER).and_then(AttrValue::as_quantizer).unwrap();
    assert!(quantizer.has_unit_alpha());
    assert!(!ScaleFactorization::new().matches(&optimized, dense));

    // the stored weights are now plain quantizer levels
    let weight = optimized.weight(dense, WeightRole::Weight).unwrap();
    let step = 1.0 / 8.0;
    for &w in weight.data.iter() {
        assert!(((w / step).round() * step - w).abs() < 1e-6, "{} is not a level", w);
    }
}

#[test]
fn dense_fixed_alpha_with_bias() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![2, 5], PrecisionType::fixed(16, 6));
    let quantizer = QuantizerConfig::bits(4, 0, true).with_alpha(Alpha::fixed(0.25));
    let dense = quantized_dense(
        &mut graph,
        x,
        "dense",
        rng_tensor(&[5, 3], &mut rng),
        Some(rng_tensor(&[3], &mut rng)),
        quantizer,
        Encoding::Native,
    );
    graph.output(TensorRef::new(dense, 0));

    let input = rng_tensor(&[2, 5], &mut rng);
    let (optimized, _) = test_optimized(&graph, &OptimizerSettings::default(), &[input]);

    // a single scale for the whole tensor
    let alpha = optimized.find_node("dense_alpha").unwrap();
    let scale = &optimized.weight(alpha, WeightRole::Scale).unwrap().data;
    assert_eq!(scale, &ArrayD::from_elem(vec![1], 0.25));
    assert_eq!(optimized.weight(alpha, WeightRole::Bias).unwrap().data, ArrayD::zeros(vec![1]));

    // the bias is stored in the unscaled domain
    let before = &graph.weight(dense, WeightRole::Bias).unwrap().data;
    let after = &optimized.weight(dense, WeightRole::Bias).unwrap().data;
    assert_tensors_match(&before.mapv(|b| b / 0.25), after, 1e-6);
}

#[test]
fn conv2d_auto_alpha() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![1, 5, 5, 2], PrecisionType::fixed(16, 6));
    let quantizer = QuantizerConfig::bits(6, 1, true).with_alpha(Alpha::Auto);
    let conv = quantized_conv2d(&mut graph, x, "conv", rng_tensor(&[3, 3, 2, 4], &mut rng), quantizer);
    graph.output(TensorRef::new(conv, 0));

    let input = rng_tensor(&[1, 5, 5, 2], &mut rng);
    let (optimized, report) = test_optimized(&graph, &OptimizerSettings::default(), &[input]);
    assert_eq!(report.transforms, 1);

    let alpha = optimized.find_node("conv_alpha").unwrap();
    assert_eq!(optimized[alpha].outputs[0].shape, vec![1, 3, 3, 4]);
    assert_eq!(optimized.weight(alpha, WeightRole::Scale).unwrap().data.shape(), &[4]);
    assert_eq!(optimized[alpha].attr("n_filt").and_then(AttrValue::as_int), Some(4));
}

#[test]
fn conv1d_po2_alpha() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![1, 6, 2], PrecisionType::fixed(16, 6));
    let quantizer = QuantizerConfig::bits(6, 1, true).with_alpha(Alpha::AutoPo2);
    let conv = quantized_conv1d(&mut graph, x, "conv", rng_tensor(&[3, 2, 4], &mut rng), quantizer);
    graph.output(TensorRef::new(conv, 0));

    let input = rng_tensor(&[1, 6, 2], &mut rng);
    let (optimized, _) = test_optimized(&graph, &OptimizerSettings::default(), &[input]);

    let alpha = optimized.find_node("conv_alpha").unwrap();
    assert_eq!(optimized[alpha].attr("n_in").and_then(AttrValue::as_int), Some(4));
    assert_eq!(optimized[alpha].attr("n_filt").and_then(AttrValue::as_int), Some(4));

    let scale = &optimized.weight(alpha, WeightRole::Scale).unwrap().data;
    assert_eq!(scale.shape(), &[4]);
    for &s in scale.iter() {
        assert_eq!(s.log2().fract(), 0.0, "{} is not a power of two", s);
    }
}

#[test]
fn followed_by_batchnorm() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![3, 4], PrecisionType::fixed(16, 6));
    let quantizer = QuantizerConfig::bits(8, 1, true).with_alpha(Alpha::Auto);
    let dense = quantized_dense(
        &mut graph,
        x,
        "dense",
        rng_tensor(&[4, 2], &mut rng),
        Some(rng_tensor(&[2], &mut rng)),
        quantizer,
        Encoding::Native,
    );
    let bn = batchnorm(&mut graph, dense, "bn", rng_tensor(&[2], &mut rng), rng_tensor(&[2], &mut rng));
    graph.output(TensorRef::new(bn, 0));

    let input = rng_tensor(&[3, 4], &mut rng);
    let (optimized, report) = test_optimized(&graph, &OptimizerSettings::default(), &[input]);

    // the inserted scale node absorbs the batchnorm
    assert_eq!(report.transforms, 2);
    assert_eq!(optimized.len(), 3);
    assert_eq!(optimized.find_node("bn"), None);

    let alpha = optimized.find_node("dense_alpha").unwrap();
    assert_eq!(optimized.outputs(), &[TensorRef::new(alpha, 0)]);
}

#[test]
fn binary_weights() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![2, 4], PrecisionType::fixed(16, 6));
    let w = rng_tensor(&[4, 3], &mut rng);
    let quantizer = QuantizerConfig::binary().with_alpha(Alpha::Auto);
    let dense = quantized_dense(&mut graph, x, "dense", w.clone(), None, quantizer, Encoding::Binary { bits: 1 });
    graph.output(TensorRef::new(dense, 0));

    let mut optimized = graph.clone();
    optimize_graph(&mut optimized, &OptimizerSettings::default()).unwrap();

    let stored = &optimized.weight(dense, WeightRole::Weight).unwrap().data;
    assert!(stored.iter().all(|&v| v == 0.0 || v == 1.0), "{}", stored);

    // the scaled binary weights the model was trained with
    let w = w.into_dimensionality::<Ix2>().unwrap();
    let scale = w.map_axis(Axis(0), |col| col.fold(0f32, |acc, &v| acc.max(v.abs())));
    let effective = Array2::from_shape_fn(w.dim(), |(i, j)| if w[(i, j)] >= 0.0 { scale[j] } else { -scale[j] });

    let input = rng_tensor(&[2, 4], &mut rng);
    let expected = input.view().into_dimensionality::<Ix2>().unwrap().dot(&effective).into_dyn();
    let actual = cpu_eval_graph(&optimized, &[input]).unwrap();
    assert_tensors_match(&expected, &actual[0], 1e-5);
}

#[test]
fn bias_quantizer_alpha() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![1, 3], PrecisionType::fixed(16, 6));
    let dense = quantized_dense(
        &mut graph,
        x,
        "dense",
        rng_tensor(&[3, 2], &mut rng),
        Some(rng_tensor(&[2], &mut rng)),
        QuantizerConfig::bits(6, 0, true),
        Encoding::Native,
    );
    let bias_quantizer = QuantizerConfig::bits(6, 0, true).with_alpha(Alpha::fixed(0.5));
    graph.set_attr(dense, BIAS_QUANTIZER, AttrValue::Quantizer(bias_quantizer)).unwrap();
    graph.output(TensorRef::new(dense, 0));

    let pass = ScaleFactorization::new();
    assert!(pass.matches(&graph, dense));
    assert!(pass.transform(&mut graph, dense).unwrap());

    assert!(!pass.matches(&graph, dense));
    let bias_quantizer = graph.attr(dense, BIAS_QUANTIZER).and_then(AttrValue::as_quantizer).unwrap();
    assert_eq!(bias_quantizer.alpha, Some(Alpha::one()));
}

#[test]
fn unit_or_missing_alpha_ignored() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut graph = Graph::new();
    let x = graph.input("x", vec![1, 3], PrecisionType::fixed(16, 6));

    for (i, quantizer) in [
        QuantizerConfig::bits(6, 0, true),
        QuantizerConfig::ternary().without_alpha(),
        QuantizerConfig::bits(6, 0, true).with_alpha(Alpha::fixed(1.0)),
    ]
    .into_iter()
    .enumerate()
    {
        let weight = rng_tensor(&[3, 2], &mut rng);
        let dense = quantized_dense(&mut graph, x, &format!("dense{}", i), weight, None, quantizer, Encoding::Native);
        assert!(!ScaleFactorization::new().matches(&graph, dense));
    }
}

#[test]
fn missing_quantizer_data() {
    let mut rng = StdRng::seed_from_u64(6);
    let mut graph = Graph::new();

    let x = graph.input("x", vec![1, 3], PrecisionType::fixed(16, 6));
    let dense = quantized_dense(
        &mut graph,
        x,
        "dense",
        rng_tensor(&[3, 2], &mut rng),
        None,
        QuantizerConfig::bits(6, 0, true).with_alpha(Alpha::Auto),
        Encoding::Native,
    );
    graph.output(TensorRef::new(dense, 0));

    // weights that were never quantized by this model
    let plain = WeightEntry::new(graph.weight(dense, WeightRole::Weight).unwrap().data.clone());
    graph.node_mut(dense).unwrap().weights.insert(WeightRole::Weight, plain);

    let result = optimize_graph(&mut graph, &OptimizerSettings::default());
    assert!(
        matches!(
            &result,
            Err(OptimizerError::MissingQuantizerData { node, what: "unquantized weights" }) if node == "dense"
        ),
        "{:?}",
        result
    );
    assert_eq!(graph.len(), 2);

    graph.node_mut(dense).unwrap().weights.clear();
    let result = ScaleFactorization::new().transform(&mut graph, dense);
    assert!(matches!(result, Err(OptimizerError::MissingQuantizerData { what: "weight tensor", .. })));
}

//! End-to-end tests for the fusion pipeline.
//!
//! Each test traces a small model, runs it through `fuse_graph`, checks
//! the resulting fusion group boundaries and compares the fused execution
//! against the unfused reference graph.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use onegraph_fuser::query::{appears_in_fusion_group, check_patterns, count_fusion_groups, count_kind, fully_fused, fusion_groups};
use onegraph_fuser::{
    fuse_graph, run_graph, trace, ExecutorState, FusedGraph, FuserConfig, Graph, KernelCompiler, OpKind, QuantConfig,
    ReferenceCompiler, RtValue, ValueType,
};
use onegraph_tensor::kernels::{Conv2dParams, PoolParams};
use onegraph_tensor::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use OpKind::{Add, Conv2d, Dequantize, Div, Linear, MatMul, QuantizePerTensor, Relu, Sigmoid, To};

// =============================================================================
// Test Helpers
// =============================================================================

fn random_tensor(rng: &mut StdRng, shape: &[usize], low: f32, high: f32) -> Tensor {
    let numel: usize = shape.iter().product();
    let data = (0..numel).map(|_| rng.gen_range(low..high)).collect();
    Tensor::from_vec(data, shape).unwrap()
}

fn tensors(rng: &mut StdRng, shapes: &[&[usize]]) -> Vec<RtValue> {
    shapes
        .iter()
        .map(|shape| RtValue::Tensor(random_tensor(rng, shape, -1.0, 1.0)))
        .collect()
}

fn compiler() -> Arc<dyn KernelCompiler> {
    Arc::new(ReferenceCompiler::new())
}

fn fuse(graph: &Graph, inputs: &[RtValue], config: &FuserConfig) -> FusedGraph {
    fuse_graph(graph, &[inputs.to_vec()], config, compiler()).unwrap()
}

fn int8() -> FuserConfig {
    FuserConfig::int8(QuantConfig::default())
}

fn assert_close(actual: &[RtValue], expected: &[RtValue], atol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        let (a, e) = (a.as_tensor().unwrap(), e.as_tensor().unwrap());
        assert_eq!(a.shape(), e.shape());
        for (x, y) in a.to_vec().iter().zip(e.to_vec()) {
            assert!((x - y).abs() <= atol, "{x} differs from {y}");
        }
    }
}

/// Runs the fused graph and its reference twice, comparing every output.
fn check_fused(fused: &FusedGraph, inputs: &[RtValue]) {
    for _ in 0..2 {
        let out = fused.run(inputs).unwrap();
        let reference = fused.run_reference(inputs).unwrap();
        assert_close(&out, &reference, 1e-6);
    }
}

fn conv_weight(rng: &mut StdRng, oc: usize, ic: usize, k: usize) -> Tensor {
    random_tensor(rng, &[oc, ic, k, k], -0.5, 0.5)
}

fn same_padding() -> Conv2dParams {
    Conv2dParams {
        padding: [1, 1],
        ..Conv2dParams::default()
    }
}

// =============================================================================
// Float Fusion
// =============================================================================

#[test]
fn test_conv_bn_relu_fuses_into_one_group() {
    let mut rng = StdRng::seed_from_u64(7);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 3, 8, 8]);
        let w = t.constant(conv_weight(&mut rng, 4, 3, 3));
        let b = t.constant(random_tensor(&mut rng, &[4], -0.1, 0.1));
        let mean = t.constant(random_tensor(&mut rng, &[4], -0.2, 0.2));
        let var = t.constant(random_tensor(&mut rng, &[4], 0.5, 1.5));
        let gamma = t.constant(random_tensor(&mut rng, &[4], 0.8, 1.2));
        let beta = t.constant(random_tensor(&mut rng, &[4], -0.1, 0.1));
        let y = x.conv2d(&w, Some(&b), same_padding());
        vec![y.batch_norm(&mean, &var, &gamma, &beta, 1e-5).relu()]
    });
    let inputs = tensors(&mut rng, &[&[1, 3, 8, 8]]);

    let fused = fuse(&graph, &inputs, &FuserConfig::fp32());
    assert_eq!(count_fusion_groups(&fused.graph), 1);
    assert!(fully_fused(&fused.graph, &[Conv2d, OpKind::BatchNorm, Relu]));
    check_fused(&fused, &inputs);
    assert_close(&fused.run(&inputs).unwrap(), &run_graph(&graph, &inputs).unwrap(), 1e-5);
}

#[test]
fn test_wildcard_output_splits_groups() {
    let mut rng = StdRng::seed_from_u64(11);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 4, 6, 6]);
        let w = t.constant(conv_weight(&mut rng, 4, 4, 3));
        let b = t.constant(random_tensor(&mut rng, &[4], -0.1, 0.1));
        let y = x.conv2d(&w, Some(&b), same_padding());
        vec![y, y.relu()]
    });
    let inputs = tensors(&mut rng, &[&[1, 4, 6, 6]]);

    let fused = fuse(&graph, &inputs, &FuserConfig::fp32());
    assert_eq!(count_fusion_groups(&fused.graph), 2);
    assert!(fully_fused(&fused.graph, &[Conv2d, Relu]));
    check_fused(&fused, &inputs);
}

#[test]
fn test_pools_feeding_add_share_a_group() {
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 3, 4, 4]);
        let params = PoolParams::new(3).stride(1).padding(1);
        vec![x.avg_pool2d(params, false).add(&x.avg_pool2d(params, false))]
    });
    let mut rng = StdRng::seed_from_u64(71);
    let inputs = tensors(&mut rng, &[&[1, 3, 4, 4]]);

    let fused = fuse(&graph, &inputs, &FuserConfig::fp32());
    assert_eq!(count_fusion_groups(&fused.graph), 1);
    assert!(fully_fused(&fused.graph, &[OpKind::AvgPool2d, Add]));
    check_fused(&fused, &inputs);
    assert_close(&fused.run(&inputs).unwrap(), &run_graph(&graph, &inputs).unwrap(), 1e-6);
}

#[test]
fn test_fp32_graph_is_untouched_without_flag() {
    let mut rng = StdRng::seed_from_u64(13);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[3, 5]);
        let w = t.constant(random_tensor(&mut rng, &[2, 5], -0.5, 0.5));
        vec![x.linear(&w, None).relu()]
    });
    let inputs = tensors(&mut rng, &[&[3, 5]]);

    let fused = fuse(&graph, &inputs, &FuserConfig::new());
    assert_eq!(count_fusion_groups(&fused.graph), 0);
    assert_eq!(count_kind(&fused.graph, Linear, false), 1);
}

#[test]
fn test_if_branches_are_never_fused() {
    let graph = trace(|t| {
        let flag = t.input_typed("flag", ValueType::Bool);
        let x = t.input("x", DType::F32, &[4, 4]);
        let y = t.input("y", DType::F32, &[4, 4]);
        t.if_then_else(&flag, |_| vec![x.mul(&y)], |_| vec![x.mul(&x)]).unwrap()
    });
    let mut rng = StdRng::seed_from_u64(17);
    let operands = tensors(&mut rng, &[&[4, 4], &[4, 4]]);

    for flag in [true, false] {
        let mut inputs = vec![RtValue::Bool(flag)];
        inputs.extend(operands.iter().cloned());
        let fused = fuse(&graph, &inputs, &FuserConfig::fp32());
        assert_eq!(count_fusion_groups(&fused.graph), 0);
        assert!(!appears_in_fusion_group(&fused.graph, OpKind::Mul));
        assert_eq!(count_kind(&fused.graph, OpKind::Mul, false), 2);
        assert_close(&fused.run(&inputs).unwrap(), &run_graph(&graph, &inputs).unwrap(), 0.0);
    }
}

#[test]
fn test_unknown_shape_is_left_out() {
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[2, 3, 4]);
        let shape = x.sizes();
        let y = x.relu().view_dynamic(&shape);
        vec![y.sigmoid()]
    });
    let mut rng = StdRng::seed_from_u64(19);
    let inputs = tensors(&mut rng, &[&[2, 3, 4]]);

    let fused = fuse(&graph, &inputs, &FuserConfig::fp32());
    assert!(!appears_in_fusion_group(&fused.graph, OpKind::View));
    assert_eq!(count_kind(&fused.graph, OpKind::View, false), 1);
    check_fused(&fused, &inputs);
}

// =============================================================================
// Quantized Fusion
// =============================================================================

#[test]
fn test_int8_wildcard_keeps_relu_outside() {
    let mut rng = StdRng::seed_from_u64(23);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 4, 6, 6]);
        let w = t.constant(conv_weight(&mut rng, 4, 4, 3));
        let b = t.constant(random_tensor(&mut rng, &[4], -0.1, 0.1));
        let y = x.conv2d(&w, Some(&b), same_padding());
        vec![y, y.relu()]
    });
    let inputs = tensors(&mut rng, &[&[1, 4, 6, 6]]);

    let fused = fuse(&graph, &inputs, &int8());
    assert_eq!(count_fusion_groups(&fused.graph), 1);
    assert!(appears_in_fusion_group(&fused.graph, Conv2d));
    assert!(appears_in_fusion_group(&fused.graph, OpKind::QuantizePerChannel));
    assert!(!appears_in_fusion_group(&fused.graph, Relu));
    assert_eq!(count_kind(&fused.graph, Relu, false), 1);
    check_fused(&fused, &inputs);
}

#[test]
fn test_linear_relu_under_every_config() {
    let mut rng = StdRng::seed_from_u64(29);
    let weight = random_tensor(&mut rng, &[8, 12], -0.5, 0.5);
    let bias = random_tensor(&mut rng, &[8], -0.1, 0.1);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[4, 12]);
        let w = t.constant(weight.clone());
        let b = t.constant(bias.clone());
        vec![x.linear(&w, Some(&b)).relu()]
    });
    let inputs = tensors(&mut rng, &[&[4, 12]]);

    for quant in QuantConfig::all() {
        let fused = fuse(&graph, &inputs, &FuserConfig::int8(quant));
        assert_eq!(count_fusion_groups(&fused.graph), 1, "{quant:?}");
        assert!(check_patterns(&fused.graph, &[vec![Dequantize, Linear, Relu]]), "{quant:?}");
        check_fused(&fused, &inputs);
    }
}

#[test]
fn test_identity_divide_is_removed() {
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[2, 3, 4]);
        let y = t.input("y", DType::F32, &[2, 4, 5]);
        vec![x.matmul(&y).div_scalar(1.0)]
    });
    let mut rng = StdRng::seed_from_u64(31);
    let inputs = tensors(&mut rng, &[&[2, 3, 4], &[2, 4, 5]]);

    let fused = fuse(&graph, &inputs, &int8());
    assert_eq!(count_fusion_groups(&fused.graph), 1);
    assert_eq!(count_kind(&fused.graph, Div, true), 0);
    assert!(check_patterns(&fused.graph, &[vec![Dequantize, MatMul]]));
    check_fused(&fused, &inputs);
}

#[test]
fn test_strided_matmul_div_add_forms_one_group() {
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[2, 3, 64]);
        let y = t.input("y", DType::F32, &[2, 3, 64]);
        let z = t.input("z", DType::F32, &[2, 1, 1, 3]);
        let z1 = x.view(&[2, 3, 16, 4]).permute(&[0, 2, 1, 3]);
        let z2 = y.view(&[2, 3, 16, 4]).permute(&[0, 2, 1, 3]);
        vec![z1.matmul(&z2.transpose(-1, -2)).div_scalar(0.4).add(&z)]
    });
    let mut rng = StdRng::seed_from_u64(73);
    let inputs = tensors(&mut rng, &[&[2, 3, 64], &[2, 3, 64], &[2, 1, 1, 3]]);

    let fused = fuse(&graph, &inputs, &int8());
    assert_eq!(count_fusion_groups(&fused.graph), 1);
    assert!(fully_fused(&fused.graph, &[MatMul, Div, Add]));
    assert!(check_patterns(&fused.graph, &[vec![Dequantize, MatMul, Div, Add]]));
    // the quantized views run outside any group
    assert!(!appears_in_fusion_group(&fused.graph, OpKind::Permute));
    assert_eq!(count_kind(&fused.graph, OpKind::Permute, false), 2);
    check_fused(&fused, &inputs);
}

#[test]
fn test_ffn_residual_forms_two_groups() {
    let mut rng = StdRng::seed_from_u64(79);
    let (hidden, inner) = (16, 32);
    let w1 = random_tensor(&mut rng, &[inner, hidden], -0.3, 0.3);
    let b1 = random_tensor(&mut rng, &[inner], -0.1, 0.1);
    let w2 = random_tensor(&mut rng, &[hidden, inner], -0.3, 0.3);
    let b2 = random_tensor(&mut rng, &[hidden], -0.1, 0.1);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[8, hidden]);
        let (w1, b1) = (t.constant(w1), t.constant(b1));
        let (w2, b2) = (t.constant(w2), t.constant(b2));
        let h = x.layer_norm(&[hidden], None, 1e-5).linear(&w1, Some(&b1)).gelu();
        let r = h.linear(&w2, Some(&b2)).add(&x);
        vec![r.layer_norm(&[hidden], None, 1e-5)]
    });
    let inputs = tensors(&mut rng, &[&[8, hidden]]);

    let fused = fuse(&graph, &inputs, &int8());
    assert_eq!(count_fusion_groups(&fused.graph), 2);
    assert!(check_patterns(
        &fused.graph,
        &[
            vec![Dequantize, Linear, OpKind::Gelu, QuantizePerTensor],
            vec![Dequantize, Linear, Add],
        ]
    ));
    assert!(fully_fused(&fused.graph, &[Linear, OpKind::Gelu]));
    assert!(!fusion_groups(&fused.graph)[0].op_sequence().contains(&OpKind::LayerNorm));
    assert!(count_kind(&fused.graph, OpKind::LayerNorm, false) >= 1);
    check_fused(&fused, &inputs);
}

#[test]
fn test_inplace_mutation_patterns_differ() {
    let mut rng = StdRng::seed_from_u64(37);
    let weight = conv_weight(&mut rng, 4, 3, 3);

    // The mutated value is not read again, so the multiply joins the conv.
    let fusable = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 3, 6, 6]);
        let w = t.constant(weight.clone());
        let y = x.conv2d(&w, None, same_padding());
        let s = y.sigmoid();
        vec![y.mul_(&s)]
    });
    // A view of the conv output taken before the multiply is read after it.
    let aliased = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 3, 6, 6]);
        let w = t.constant(weight.clone());
        let y = x.conv2d(&w, None, same_padding());
        let s = y.sigmoid();
        let c = y.select(0, 0);
        let _ = y.mul_(&s);
        vec![c.add_scalar_(2.0)]
    });
    let inputs = tensors(&mut rng, &[&[1, 3, 6, 6]]);

    let first = fuse(&fusable, &inputs, &int8());
    assert_eq!(count_fusion_groups(&first.graph), 1);
    assert!(check_patterns(&first.graph, &[vec![Dequantize, Conv2d, Sigmoid, OpKind::Mul]]));
    check_fused(&first, &inputs);

    let second = fuse(&aliased, &inputs, &int8());
    assert_eq!(count_fusion_groups(&second.graph), 1);
    assert!(check_patterns(&second.graph, &[vec![Dequantize, Conv2d]]));
    assert!(!appears_in_fusion_group(&second.graph, OpKind::Mul));
    assert_eq!(count_kind(&second.graph, OpKind::Mul, false), 1);
    assert!(!appears_in_fusion_group(&second.graph, OpKind::Add));
    check_fused(&second, &inputs);

    let ops = |fused: &FusedGraph| fusion_groups(&fused.graph)[0].op_sequence().to_vec();
    assert_ne!(ops(&first), ops(&second));
}

// =============================================================================
// Quantize Lifting
// =============================================================================

fn attention_scores(rng: &mut StdRng) -> Graph {
    let w1 = random_tensor(rng, &[64, 28], -0.2, 0.2);
    let b1 = random_tensor(rng, &[64], -0.1, 0.1);
    let w2 = random_tensor(rng, &[64, 28], -0.2, 0.2);
    let b2 = random_tensor(rng, &[64], -0.1, 0.1);
    trace(|t| {
        let x = t.input("x", DType::F32, &[2, 3, 28]);
        let y = t.input("y", DType::F32, &[2, 3, 28]);
        let (w1, b1) = (t.constant(w1), t.constant(b1));
        let (w2, b2) = (t.constant(w2), t.constant(b2));
        let z1 = x.linear(&w1, Some(&b1)).view(&[2, 3, 16, 4]).permute(&[0, 2, 1, 3]);
        let z2 = y.linear(&w2, Some(&b2)).view(&[2, 3, 16, 4]).permute(&[0, 2, 1, 3]);
        vec![z1.matmul(&z2.transpose(-1, -2))]
    })
}

#[test]
fn test_quantize_lifts_over_views() {
    let mut rng = StdRng::seed_from_u64(41);
    let graph = attention_scores(&mut rng);
    let inputs = tensors(&mut rng, &[&[2, 3, 28], &[2, 3, 28]]);

    let fused = fuse(&graph, &inputs, &int8());
    assert_eq!(fused.stats.lift.lifted, 2);
    assert_eq!(count_fusion_groups(&fused.graph), 3);
    assert!(fully_fused(&fused.graph, &[Dequantize, Linear, MatMul]));
    assert!(check_patterns(
        &fused.graph,
        &[
            vec![Dequantize, Linear, QuantizePerTensor],
            vec![Dequantize, Linear, QuantizePerTensor],
            vec![Dequantize, MatMul],
        ]
    ));
    check_fused(&fused, &inputs);
}

#[test]
fn test_quantize_lifts_with_bf16_casts() {
    let mut rng = StdRng::seed_from_u64(43);
    let graph = attention_scores(&mut rng);
    let inputs = tensors(&mut rng, &[&[2, 3, 28], &[2, 3, 28]]);

    let config = int8().int8_bf16(true);
    let fused = fuse(&graph, &inputs, &config);
    assert_eq!(count_fusion_groups(&fused.graph), 3);
    assert!(check_patterns(
        &fused.graph,
        &[
            vec![Dequantize, To, Linear, To, QuantizePerTensor],
            vec![Dequantize, To, Linear, To, QuantizePerTensor],
            vec![Dequantize, To, MatMul],
        ]
    ));
    check_fused(&fused, &inputs);
}

#[test]
fn test_lift_without_quantization_support_in_consumer() {
    let mut rng = StdRng::seed_from_u64(47);
    let w1 = conv_weight(&mut rng, 8, 3, 1);
    let b1 = random_tensor(&mut rng, &[8], -0.1, 0.1);
    let w2 = conv_weight(&mut rng, 8, 8, 1);
    let b2 = random_tensor(&mut rng, &[8], -0.1, 0.1);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[1, 3, 8, 8]);
        let y = t.input("y", DType::F32, &[1, 8, 8, 8]);
        let (w1, b1) = (t.constant(w1), t.constant(b1));
        let (w2, b2) = (t.constant(w2), t.constant(b2));
        let z1 = x.conv2d(&w1, Some(&b1), Conv2dParams::default()).permute(&[0, 3, 1, 2]);
        let z2 = z1.conv2d(&w2, Some(&b2), Conv2dParams::default());
        let z = z1.add(&y);
        vec![z2.add(&z)]
    });
    let inputs = tensors(&mut rng, &[&[1, 3, 8, 8], &[1, 8, 8, 8]]);

    let fused = fuse(&graph, &inputs, &int8());
    assert_eq!(fused.stats.lift.lifted, 0);
    assert_eq!(count_fusion_groups(&fused.graph), 2);
    assert!(appears_in_fusion_group(&fused.graph, Conv2d));
    assert!(check_patterns(&fused.graph, &[vec![Dequantize, Conv2d], vec![Dequantize, Conv2d, Add]]));
    check_fused(&fused, &inputs);
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn test_shape_change_falls_back_then_recompiles() {
    let mut rng = StdRng::seed_from_u64(53);
    let weight = random_tensor(&mut rng, &[64, 28], -0.2, 0.2);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[32, 28]);
        let w = t.constant(weight);
        vec![x.linear(&w, None)]
    });
    let traced = tensors(&mut rng, &[&[32, 28]]);
    let smaller = tensors(&mut rng, &[&[5, 28]]);

    let reference = Arc::new(ReferenceCompiler::new());
    let fused = fuse_graph(&graph, &[traced.clone()], &FuserConfig::fp32(), reference.clone()).unwrap();
    let groups = fusion_groups(&fused.graph);
    assert_eq!(groups.len(), 1);
    let executor = groups[0].executor();
    assert_eq!(executor.state(), ExecutorState::Uncompiled);

    check_fused(&fused, &traced);
    assert_eq!(executor.state(), ExecutorState::Compiled);
    assert_eq!(reference.compilations(), 1);

    let out = fused.run(&smaller).unwrap();
    assert_eq!(executor.state(), ExecutorState::Fallback);
    assert_eq!(out[0].as_tensor().unwrap().shape(), &[5, 64]);
    assert_close(&out, &run_graph(&graph, &smaller).unwrap(), 1e-6);
    assert_eq!(reference.compilations(), 1);

    let out = fused.run(&smaller).unwrap();
    assert_eq!(executor.state(), ExecutorState::Compiled);
    assert_eq!(reference.compilations(), 2);
    assert_close(&out, &run_graph(&graph, &smaller).unwrap(), 1e-6);

    let stats = executor.stats();
    assert_eq!(stats.fallback_runs, 1);
    assert_eq!(stats.cached_signatures, 1);
}

#[test]
fn test_larger_cache_keeps_both_signatures() {
    let mut rng = StdRng::seed_from_u64(59);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[6, 10]);
        vec![x.sigmoid().mul_scalar(2.0).relu()]
    });
    let first = tensors(&mut rng, &[&[6, 10]]);
    let second = tensors(&mut rng, &[&[3, 10]]);

    let fused = fuse(&graph, &first, &FuserConfig::fp32().cache_capacity(2));
    let groups = fusion_groups(&fused.graph);
    assert_eq!(groups.len(), 1);
    for inputs in [&first, &second, &first, &second] {
        check_fused(&fused, inputs);
    }
    let stats = groups[0].executor().stats();
    assert_eq!(stats.compilations, 2);
    assert_eq!(stats.fallback_runs, 0);
    assert_eq!(stats.cached_signatures, 2);
}

#[test]
fn test_concurrent_runs_match_reference() {
    let mut rng = StdRng::seed_from_u64(61);
    let weight = random_tensor(&mut rng, &[16, 8], -0.5, 0.5);
    let graph = trace(|t| {
        let x = t.input("x", DType::F32, &[4, 8]);
        let w = t.constant(weight);
        vec![x.linear(&w, None).gelu()]
    });
    let batches: Vec<Vec<RtValue>> = (0..4)
        .map(|i| tensors(&mut rng, &[&[4 + i % 2, 8]]))
        .collect();

    let fused = fuse(&graph, &batches[0], &FuserConfig::fp32());
    std::thread::scope(|scope| {
        for inputs in &batches {
            let fused = &fused;
            scope.spawn(move || {
                for _ in 0..8 {
                    let out = fused.run(inputs).unwrap();
                    assert_close(&out, &fused.run_reference(inputs).unwrap(), 1e-6);
                }
            });
        }
    });
}

#[test]
fn test_fusion_is_deterministic() {
    type Boundaries = Vec<(String, Vec<OpKind>, usize, usize)>;
    let boundaries = |fused: &FusedGraph| -> Boundaries {
        fusion_groups(&fused.graph)
            .iter()
            .map(|g| {
                (
                    g.name().to_string(),
                    g.op_sequence().to_vec(),
                    g.subgraph().inputs().len(),
                    g.subgraph().outputs().len(),
                )
            })
            .collect()
    };
    let top_level = |fused: &FusedGraph| -> Vec<OpKind> {
        fused.graph.nodes().iter().map(|&n| fused.graph.node(n).kind()).collect()
    };

    let mut rng = StdRng::seed_from_u64(67);
    let graph = attention_scores(&mut rng);
    let inputs = tensors(&mut rng, &[&[2, 3, 28], &[2, 3, 28]]);
    let first = fuse(&graph, &inputs, &int8());
    assert_eq!(boundaries(&first).len(), 3);
    for _ in 0..3 {
        let again = fuse(&graph, &inputs, &int8());
        assert_eq!(boundaries(&again), boundaries(&first));
        assert_eq!(top_level(&again), top_level(&first));
    }

    let mut rng = StdRng::seed_from_u64(67);
    let rebuilt = attention_scores(&mut rng);
    let inputs = tensors(&mut rng, &[&[2, 3, 28], &[2, 3, 28]]);
    assert_eq!(boundaries(&fuse(&rebuilt, &inputs, &int8())), boundaries(&first));
}

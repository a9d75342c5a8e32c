//! Graph Simplification
//!
//! Algebraic cleanup passes run before and after quantization markers are
//! inserted: inplace-to-functional conversion, identity binary removal,
//! redundant cast removal, weight quantization folding and dead code
//! elimination.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::kernels::{quantize_per_channel, quantize_per_tensor, BinaryOp};
use onegraph_tensor::DType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alias::AliasAnalysis;
use crate::error::FuseResult;
use crate::ir::{ConstValue, Graph, NodeId, Op, ValueId};

// =============================================================================
// Passes
// =============================================================================

/// Simplification passes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimplifyPass {
    /// Rewrite inplace ops whose mutation is unobservable to out-of-place form.
    RemoveMutation,
    /// Remove `x + 0`, `x - 0`, `x * 1` and `x / 1`.
    EliminateIdentity,
    /// Remove casts to the same dtype and lossless cast round trips.
    EliminateRedundantCasts,
    /// Replace quantize nodes over constants with quantized constants.
    FoldWeightQuantization,
    /// Remove nodes whose results are unused.
    DeadCodeElimination,
}

/// Counts of rewrites performed by a simplifier run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifyStats {
    /// Inplace nodes rewritten to out-of-place.
    pub mutations_removed: usize,
    /// Identity binaries removed.
    pub identities_removed: usize,
    /// Cast nodes removed.
    pub casts_removed: usize,
    /// Quantize nodes folded into constants.
    pub weights_folded: usize,
    /// Dead nodes removed.
    pub dead_nodes_removed: usize,
}

impl SimplifyStats {
    fn merge(&mut self, other: Self) {
        self.mutations_removed += other.mutations_removed;
        self.identities_removed += other.identities_removed;
        self.casts_removed += other.casts_removed;
        self.weights_folded += other.weights_folded;
        self.dead_nodes_removed += other.dead_nodes_removed;
    }
}

/// Runs a sequence of simplification passes.
#[derive(Debug, Clone)]
pub struct Simplifier {
    passes: Vec<SimplifyPass>,
}

impl Simplifier {
    /// Creates a simplifier with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a simplifier with the passes run before quantization.
    pub fn default_passes() -> Self {
        Self::with_passes(&[
            SimplifyPass::RemoveMutation,
            SimplifyPass::EliminateIdentity,
            SimplifyPass::EliminateRedundantCasts,
            SimplifyPass::DeadCodeElimination,
        ])
    }

    /// Creates a simplifier running the given passes in order.
    pub fn with_passes(passes: &[SimplifyPass]) -> Self {
        Self {
            passes: passes.to_vec(),
        }
    }

    /// Adds a pass.
    pub fn add_pass(&mut self, pass: SimplifyPass) {
        self.passes.push(pass);
    }

    /// Runs all passes on the graph.
    pub fn run(&self, graph: &mut Graph) -> FuseResult<SimplifyStats> {
        let mut stats = SimplifyStats::default();
        for pass in &self.passes {
            stats.merge(run_pass(graph, *pass)?);
        }
        Ok(stats)
    }
}

impl Default for Simplifier {
    fn default() -> Self {
        Self::default_passes()
    }
}

fn run_pass(graph: &mut Graph, pass: SimplifyPass) -> FuseResult<SimplifyStats> {
    let mut stats = SimplifyStats::default();
    match pass {
        SimplifyPass::RemoveMutation => stats.mutations_removed = remove_mutation(graph),
        SimplifyPass::EliminateIdentity => stats.identities_removed = eliminate_identity(graph)?,
        SimplifyPass::EliminateRedundantCasts => stats.casts_removed = eliminate_casts(graph)?,
        SimplifyPass::FoldWeightQuantization => stats.weights_folded = fold_weight_quantization(graph)?,
        SimplifyPass::DeadCodeElimination => stats.dead_nodes_removed = dead_code_elimination(graph)?,
    }
    Ok(stats)
}

// =============================================================================
// Mutation Removal
// =============================================================================

fn remove_mutation(graph: &mut Graph) -> usize {
    let mut converted = 0;
    loop {
        let analysis = AliasAnalysis::build(graph);
        let next = graph
            .nodes()
            .iter()
            .copied()
            .find(|&n| graph.node(n).op.is_inplace() && analysis.is_inplace_safe(graph, n));
        let Some(node) = next else {
            break;
        };
        let op = graph.node(node).op.out_of_place();
        debug!(node = node.index(), op = op.name(), "inplace op rewritten to out-of-place");
        graph.set_op(node, op);
        converted += 1;
    }
    converted
}

// =============================================================================
// Identity and Cast Elimination
// =============================================================================

/// Replaces `old` with `new` and removes the node, unless `old` is the
/// base of a remaining inplace op.
fn bypass(graph: &mut Graph, node: NodeId, old: ValueId, new: ValueId) -> FuseResult<bool> {
    let mutated = graph
        .value(old)
        .uses()
        .iter()
        .any(|u| u.index == 0 && graph.node(u.node).op.is_inplace());
    if mutated {
        return Ok(false);
    }
    graph.replace_all_uses(old, new);
    graph.remove_node(node)?;
    Ok(true)
}

fn scalar_constant(graph: &Graph, value: ValueId) -> Option<f64> {
    graph.constant_value(value).and_then(ConstValue::as_scalar)
}

fn eliminate_identity(graph: &mut Graph) -> FuseResult<usize> {
    let mut removed = 0;
    for node in graph.all_nodes() {
        if !graph.contains(node) {
            continue;
        }
        let n = graph.node(node);
        let Op::Binary { op, inplace: false } = n.op else {
            continue;
        };
        let (Some(identity), [lhs, rhs]) = (op.identity_operand(), n.inputs()) else {
            continue;
        };
        let identity = f64::from(identity);
        let keep = if scalar_constant(graph, *rhs) == Some(identity) {
            *lhs
        } else if matches!(op, BinaryOp::Add | BinaryOp::Mul) && scalar_constant(graph, *lhs) == Some(identity) {
            *rhs
        } else {
            continue;
        };
        let out = n.outputs()[0];
        let unchanged = match (graph.tensor_type(keep), graph.tensor_type(out)) {
            (Some(k), Some(o)) => k.dtype == o.dtype && k.shape.is_some() && k.shape == o.shape,
            _ => false,
        };
        if unchanged && bypass(graph, node, out, keep)? {
            debug!(node = node.index(), op = op.name(), "identity binary removed");
            removed += 1;
        }
    }
    Ok(removed)
}

/// True when casting `from -> via -> from` reproduces every value.
fn lossless_round_trip(from: DType, via: DType) -> bool {
    from == via || (from == DType::BF16 && via == DType::F32)
}

fn eliminate_casts(graph: &mut Graph) -> FuseResult<usize> {
    let mut removed = 0;
    for node in graph.all_nodes() {
        if !graph.contains(node) {
            continue;
        }
        let n = graph.node(node);
        let Op::To { dtype } = n.op else {
            continue;
        };
        let (input, out) = (n.inputs()[0], n.outputs()[0]);
        let Some(input_dtype) = graph.tensor_type(input).map(|t| t.dtype) else {
            continue;
        };

        if input_dtype == dtype {
            if bypass(graph, node, out, input)? {
                debug!(node = node.index(), dtype = %dtype, "cast to own dtype removed");
                removed += 1;
            }
            continue;
        }

        let Some(inner) = graph.producer_node(input) else {
            continue;
        };
        if !matches!(graph.node(inner).op, Op::To { .. }) {
            continue;
        }
        let source = graph.node(inner).inputs()[0];
        let Some(source_dtype) = graph.tensor_type(source).map(|t| t.dtype) else {
            continue;
        };
        if source_dtype == dtype && lossless_round_trip(source_dtype, input_dtype) && bypass(graph, node, out, source)? {
            removed += 1;
            if graph.value(input).uses().is_empty() && !graph.is_block_return(input) {
                graph.remove_node(inner)?;
                removed += 1;
            }
            debug!(node = node.index(), from = %source_dtype, via = %input_dtype, "cast round trip removed");
        }
    }
    Ok(removed)
}

// =============================================================================
// Weight Folding
// =============================================================================

fn fold_weight_quantization(graph: &mut Graph) -> FuseResult<usize> {
    let mut folded = 0;
    for node in graph.nodes().to_vec() {
        let n = graph.node(node);
        let Some(ConstValue::Tensor(weight)) = n.inputs().first().and_then(|&v| graph.constant_value(v)) else {
            continue;
        };
        let quantized = match &n.op {
            Op::QuantizePerTensor {
                scale,
                zero_point,
                dtype,
            } => quantize_per_tensor(weight, *scale, *zero_point, *dtype)?,
            Op::QuantizePerChannel {
                scales,
                zero_points,
                axis,
                dtype,
            } => quantize_per_channel(weight, scales, zero_points, *axis, *dtype)?,
            _ => continue,
        };
        let out = n.outputs()[0];
        let constant = ConstValue::Tensor(quantized);
        let ty = constant.value_type();
        let replacement = graph.insert_before(node, Op::Constant(constant), &[], 1);
        let new_out = graph.node(replacement).outputs()[0];
        graph.set_type(new_out, ty);
        graph.replace_all_uses(out, new_out);
        graph.remove_node(node)?;
        debug!(node = node.index(), "weight quantization folded into constant");
        folded += 1;
    }
    Ok(folded)
}

// =============================================================================
// Dead Code Elimination
// =============================================================================

fn has_side_effects(graph: &Graph, node: NodeId) -> bool {
    let n = graph.node(node);
    n.op.is_inplace()
        || n.blocks().iter().any(|&b| {
            graph
                .block_nodes(b)
                .iter()
                .any(|&inner| has_side_effects(graph, inner))
        })
}

fn dead_code_elimination(graph: &mut Graph) -> FuseResult<usize> {
    let mut removed = 0;
    loop {
        let mut changed = false;
        for node in graph.all_nodes().into_iter().rev() {
            if !graph.contains(node) || has_side_effects(graph, node) {
                continue;
            }
            let unused = graph
                .node(node)
                .outputs()
                .iter()
                .all(|&v| graph.value(v).uses().is_empty() && !graph.is_block_return(v));
            if unused {
                graph.remove_node(node)?;
                removed += 1;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    if removed > 0 {
        debug!(removed, "dead nodes removed");
    }
    Ok(removed)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpKind;
    use crate::propagate::propagate;
    use crate::trace::trace;
    use onegraph_tensor::Tensor;

    fn kinds(graph: &Graph) -> Vec<OpKind> {
        graph.nodes().iter().map(|&n| graph.node(n).kind()).collect()
    }

    #[test]
    fn test_div_by_one_removed() {
        let mut graph = trace(|t| {
            let a = t.input("a", DType::F32, &[2, 3]);
            let b = t.input("b", DType::F32, &[3, 4]);
            vec![a.matmul(&b).div_scalar(1.0)]
        });
        propagate(&mut graph).unwrap();
        let stats = Simplifier::default_passes().run(&mut graph).unwrap();
        assert_eq!(stats.identities_removed, 1);
        assert_eq!(kinds(&graph), vec![OpKind::MatMul]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_identity_kept_when_dtype_changes() {
        let mut graph = trace(|t| {
            let a = t.input("a", DType::F32, &[4]);
            let i = t.input("i", DType::I64, &[4]);
            let zero = t.scalar(0.0);
            vec![i.mul_scalar(1.0), zero.add(&a)]
        });
        propagate(&mut graph).unwrap();
        let stats = Simplifier::default_passes().run(&mut graph).unwrap();
        assert_eq!(stats.identities_removed, 1);
        assert_eq!(graph.outputs()[1], graph.inputs()[0]);
    }

    #[test]
    fn test_cast_round_trip_rules() {
        let mut graph = trace(|t| {
            let a = t.input("a", DType::BF16, &[4]);
            let b = t.input("b", DType::F32, &[4]);
            vec![a.to(DType::F32).to(DType::BF16), b.to(DType::BF16).to(DType::F32), b.to(DType::F32)]
        });
        propagate(&mut graph).unwrap();
        Simplifier::default_passes().run(&mut graph).unwrap();
        assert_eq!(graph.outputs()[0], graph.inputs()[0]);
        assert_ne!(graph.outputs()[1], graph.inputs()[1]);
        assert_eq!(graph.outputs()[2], graph.inputs()[1]);
        assert_eq!(kinds(&graph), vec![OpKind::To, OpKind::To]);
    }

    #[test]
    fn test_safe_mutation_removed() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[4]);
            let a = x.relu();
            let s = a.sigmoid();
            vec![a.mul_(&s)]
        });
        let stats = Simplifier::with_passes(&[SimplifyPass::RemoveMutation]).run(&mut graph).unwrap();
        assert_eq!(stats.mutations_removed, 1);
        assert!(graph.nodes().iter().all(|&n| !graph.node(n).op.is_inplace()));
    }

    #[test]
    fn test_dce_keeps_inplace() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 4]);
            let a = x.relu();
            let _unused = a.sigmoid();
            let _ = a.select(0, 0).add_scalar_(1.0);
            vec![a]
        });
        let stats = Simplifier::default_passes().run(&mut graph).unwrap();
        assert_eq!(stats.dead_nodes_removed, 1);
        assert_eq!(stats.mutations_removed, 0);
        assert!(kinds(&graph).contains(&OpKind::Add));
    }

    #[test]
    fn test_fold_weight_quantization() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 2]);
            let w = t.constant(Tensor::from_vec(vec![0.5, -0.5, 1.0, 0.0], &[2, 2]).unwrap());
            let wq = w.quantize_per_channel(vec![0.01, 0.01], vec![0, 0], 0, DType::QInt8);
            vec![x.linear(&wq.dequantize(), None)]
        });
        let passes = [SimplifyPass::FoldWeightQuantization, SimplifyPass::DeadCodeElimination];
        let stats = Simplifier::with_passes(&passes).run(&mut graph).unwrap();
        assert_eq!(stats.weights_folded, 1);
        assert_eq!(kinds(&graph), vec![OpKind::Constant, OpKind::Dequantize, OpKind::Linear]);
        let folded = graph.node(graph.nodes()[0]);
        match &folded.op {
            Op::Constant(ConstValue::Tensor(q)) => assert_eq!(q.dtype(), DType::QInt8),
            other => panic!("unexpected op {other:?}"),
        }
    }
}

//! Quantize Lifting
//!
//! Moves a per-tensor quantize up across a chain of layout-only operators
//! so the chain runs on the narrow dtype and the quantize sits directly
//! after the partition that produces the chain's base value. A bf16 to f32
//! cast feeding the quantize moves with it. A lift is refused, leaving the
//! graph untouched, when a value that would become narrow has a consumer
//! that cannot accept a quantized operand.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::DType;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FuseResult;
use crate::ir::{Graph, NodeId, Op, ValueId};
use crate::partition::Partition;

/// Counts of lift decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftStats {
    /// Quantize nodes moved.
    pub lifted: usize,
    /// Lifts refused by the legality check.
    pub rejected: usize,
}

struct Candidate {
    quantize: NodeId,
    cast: Option<NodeId>,
    /// Layout operators from the quantize upward.
    chain: Vec<NodeId>,
    base: ValueId,
}

fn find_candidate(graph: &Graph, quantize: NodeId) -> Option<Candidate> {
    let input = graph.node(quantize).inputs()[0];
    let mut cast = None;
    let mut cur = input;
    if let Some(p) = graph.producer_node(input) {
        let single_use = graph.value(input).uses().len() == 1 && !graph.is_block_return(input);
        let from_bf16 = graph
            .tensor_type(graph.node(p).inputs()[0])
            .map_or(false, |t| t.dtype == DType::BF16);
        if single_use && from_bf16 && matches!(graph.node(p).op, Op::To { dtype: DType::F32 }) {
            cast = Some(p);
            cur = graph.node(p).inputs()[0];
        }
    }

    let mut chain = Vec::new();
    while let Some(p) = graph.producer_node(cur) {
        if !graph.is_top_level(p) || !graph.node(p).op.is_shape_preserving_view() {
            break;
        }
        chain.push(p);
        cur = graph.node(p).inputs()[0];
    }
    if chain.is_empty() {
        return None;
    }
    Some(Candidate {
        quantize,
        cast,
        chain,
        base: cur,
    })
}

/// Checks that every value of the chain may become narrow. Outside the moved
/// nodes only a dequantize accepts a quantized operand.
fn is_legal(graph: &Graph, candidate: &Candidate) -> bool {
    let unit: FxHashSet<NodeId> = candidate
        .chain
        .iter()
        .copied()
        .chain(candidate.cast)
        .chain(std::iter::once(candidate.quantize))
        .collect();

    for &node in &candidate.chain {
        let out = graph.node(node).outputs()[0];
        if graph.is_block_return(out) {
            return false;
        }
        for u in graph.value(out).uses() {
            if unit.contains(&u.node) {
                continue;
            }
            let consumer = graph.node(u.node);
            if !matches!(consumer.op, Op::Dequantize) {
                debug!(
                    consumer = consumer.op.name(),
                    value = %out,
                    "lift rejected: consumer cannot take a quantized operand"
                );
                return false;
            }
        }
    }
    true
}

/// Lifts quantize nodes toward the partitions producing their inputs.
///
/// Types are stale after a lift; callers propagate before partitioning again.
pub fn lift_quantize(graph: &mut Graph, partitions: &[Partition]) -> FuseResult<LiftStats> {
    let mut stats = LiftStats::default();
    for node in graph.nodes().to_vec() {
        if !graph.contains(node) {
            continue;
        }
        if !matches!(graph.node(node).op, Op::QuantizePerTensor { .. }) {
            continue;
        }
        let Some(candidate) = find_candidate(graph, node) else {
            continue;
        };
        let Some(producer) = graph.producer_node(candidate.base) else {
            continue;
        };
        if !partitions.iter().any(|p| p.contains(producer)) {
            continue;
        }
        if !is_legal(graph, &candidate) {
            stats.rejected += 1;
            continue;
        }
        rewrite(graph, &candidate, producer)?;
        stats.lifted += 1;
    }
    if stats.lifted + stats.rejected > 0 {
        debug!(lifted = stats.lifted, rejected = stats.rejected, "quantize lift finished");
    }
    Ok(stats)
}

fn rewrite(graph: &mut Graph, candidate: &Candidate, producer: NodeId) -> FuseResult<()> {
    let (Some(&first), Some(&last)) = (candidate.chain.last(), candidate.chain.first()) else {
        return Ok(());
    };
    let q_op = graph.node(candidate.quantize).op.clone();
    let mut anchor = producer;
    let mut value = candidate.base;
    if let Some(cast) = candidate.cast {
        let op = graph.node(cast).op.clone();
        anchor = graph.insert_after(anchor, op, &[value], 1);
        value = graph.node(anchor).outputs()[0];
    }
    let q = graph.insert_after(anchor, q_op, &[value], 1);
    let narrow = graph.node(q).outputs()[0];
    graph.set_input(first, 0, narrow);
    let old = graph.node(candidate.quantize).outputs()[0];
    let chain_out = graph.node(last).outputs()[0];
    graph.replace_all_uses(old, chain_out);
    graph.remove_node(candidate.quantize)?;
    if let Some(cast) = candidate.cast {
        graph.remove_node(cast)?;
    }
    debug!(
        quantize = candidate.quantize.index(),
        chain = candidate.chain.len(),
        "quantize lifted above layout chain"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

//! Graph Queries
//!
//! Inspection helpers over a fused graph: the installed fusion groups,
//! operator counts inside and outside them, and ordered pattern checks.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use crate::group::FusionGroup;
use crate::ir::{Graph, Op, OpKind};

/// Returns the fusion groups of a graph ordered by creation.
pub fn fusion_groups(graph: &Graph) -> Vec<Arc<FusionGroup>> {
    let mut groups: Vec<Arc<FusionGroup>> = graph
        .all_nodes()
        .into_iter()
        .filter_map(|n| match &graph.node(n).op {
            Op::FusionGroup(group) => Some(Arc::clone(group)),
            _ => None,
        })
        .collect();
    groups.sort_by_key(|g| g.index());
    groups
}

/// Returns the number of fusion groups.
pub fn count_fusion_groups(graph: &Graph) -> usize {
    count_kind(graph, OpKind::FusionGroup, false)
}

/// Counts nodes of `kind`, optionally including fusion group bodies.
pub fn count_kind(graph: &Graph, kind: OpKind, consider_subgraphs: bool) -> usize {
    graph
        .all_nodes()
        .into_iter()
        .map(|n| {
            let node = graph.node(n);
            let own = usize::from(node.kind() == kind);
            let nested = match &node.op {
                Op::FusionGroup(group) if consider_subgraphs => count_kind(group.subgraph(), kind, true),
                _ => 0,
            };
            own + nested
        })
        .sum()
}

/// Returns true if any fusion group contains an operator of `kind`.
pub fn appears_in_fusion_group(graph: &Graph, kind: OpKind) -> bool {
    fusion_groups(graph)
        .iter()
        .any(|g| g.op_sequence().contains(&kind))
}

/// Returns true if every operator of the given kinds sits inside a fusion group.
pub fn fully_fused(graph: &Graph, kinds: &[OpKind]) -> bool {
    kinds
        .iter()
        .all(|&k| count_kind(graph, k, false) == 0 && appears_in_fusion_group(graph, k))
}

fn is_subsequence(pattern: &[OpKind], sequence: &[OpKind]) -> bool {
    let mut it = sequence.iter();
    pattern.iter().all(|p| it.any(|k| k == p))
}

/// Checks that pattern `i` occurs, in order, in the operator sequence of
/// fusion group `i`.
pub fn check_patterns(graph: &Graph, patterns: &[Vec<OpKind>]) -> bool {
    let groups = fusion_groups(graph);
    groups.len() >= patterns.len()
        && patterns
            .iter()
            .zip(&groups)
            .all(|(pattern, group)| is_subsequence(pattern, group.op_sequence()))
}

//! Partitioning
//!
//! Grows partitions greedily in definition order. Each unassigned fusable
//! node seeds a partition that absorbs adjacent fusable nodes until nothing
//! more can join. An edge may be crossed only when every consumer of the
//! value is fusable and the value is not returned from the graph; the
//! quantization roles decide where a partition starts and ends; a partition
//! holds at most one conv, linear or matmul anchor, while pooling joins
//! freely; and an absorption that would create a cycle between partitions
//! is refused.
//!
//! Installed partitions become `fusion_group` nodes whose subgraph is a copy
//! of the member nodes.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::compiler::KernelCompiler;
use crate::error::FuseResult;
use crate::group::FusionGroup;
use crate::ir::{Graph, NodeId, Op, OpKind, ValueId};
use crate::runtime::PartitionExecutor;
use crate::support::{classify, OpClass, Support};

// =============================================================================
// Partition
// =============================================================================

/// A set of top-level nodes to be fused together, in block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    nodes: Vec<NodeId>,
}

impl Partition {
    /// Returns the member nodes in block order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true for an empty partition.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if `node` is a member.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Returns the operator kinds of the members in block order.
    pub fn kinds(&self, graph: &Graph) -> Vec<OpKind> {
        self.nodes.iter().map(|&n| graph.node(n).kind()).collect()
    }

    /// Returns true if a member quantizes or dequantizes.
    pub fn has_quant_marker(&self, graph: &Graph) -> bool {
        self.nodes.iter().any(|&n| graph.node(n).kind().is_quant_marker())
    }

    /// Returns true if a member is a conv, linear, matmul or pooling op.
    pub fn has_compute(&self, graph: &Graph) -> bool {
        self.nodes
            .iter()
            .any(|&n| classify(graph, n).class().map_or(false, OpClass::is_compute))
    }

    /// Decides whether the partition is turned into a fusion group.
    ///
    /// Partitions touching quantization are rewritten only around a compute
    /// op, so markers next to layout or normalization ops stay unfused.
    /// Purely floating point partitions are rewritten when `fuse_fp32_bf16`
    /// is set, except a lone cast.
    pub fn should_rewrite(&self, graph: &Graph, fuse_fp32_bf16: bool) -> bool {
        if self.has_quant_marker(graph) {
            return self.has_compute(graph);
        }
        if let [single] = self.nodes.as_slice() {
            if graph.node(*single).kind() == OpKind::To {
                return false;
            }
        }
        fuse_fp32_bf16
    }
}

// =============================================================================
// Partitioner
// =============================================================================

/// Greedy partitioner over the top block of a graph.
pub struct Partitioner<'a> {
    graph: &'a Graph,
    support: FxHashMap<NodeId, Support>,
    assignment: FxHashMap<NodeId, usize>,
    partitions: Vec<Vec<NodeId>>,
}

impl<'a> Partitioner<'a> {
    /// Classifies every top-level node of `graph`.
    pub fn new(graph: &'a Graph) -> Self {
        let support = graph
            .nodes()
            .iter()
            .map(|&n| {
                let s = classify(graph, n);
                if let Support::Wildcard(reason) = s {
                    debug!(node = n.index(), op = graph.node(n).op.name(), reason, "wildcard");
                }
                (n, s)
            })
            .collect();
        Self {
            graph,
            support,
            assignment: FxHashMap::default(),
            partitions: Vec::new(),
        }
    }

    fn class(&self, node: NodeId) -> Option<OpClass> {
        self.support.get(&node).and_then(|s| s.class())
    }

    /// Forms all partitions in definition order.
    pub fn run(mut self) -> Vec<Partition> {
        for &seed in self.graph.nodes() {
            if self.assignment.contains_key(&seed) || self.class(seed).is_none() {
                continue;
            }
            let id = self.partitions.len();
            self.assignment.insert(seed, id);
            self.partitions.push(vec![seed]);
            self.grow(id);
        }

        let positions = self.graph.positions(self.graph.top_block());
        self.partitions
            .into_iter()
            .map(|mut nodes| {
                nodes.sort_by_key(|n| positions.get(n).copied().unwrap_or(usize::MAX));
                Partition { nodes }
            })
            .inspect(|p| {
                debug!(
                    nodes = p.len(),
                    ops = ?p.kinds(self.graph),
                    "partition formed"
                );
            })
            .collect()
    }

    fn grow(&mut self, id: usize) {
        let mut queue: VecDeque<NodeId> = self.partitions[id].iter().copied().collect();
        while let Some(member) = queue.pop_front() {
            for candidate in self.neighbours(member) {
                if self.assignment.contains_key(&candidate) || !self.can_absorb(id, member, candidate) {
                    continue;
                }
                self.assignment.insert(candidate, id);
                self.partitions[id].push(candidate);
                queue.push_back(candidate);
            }
        }
    }

    /// Producers of the inputs, then consumers of the outputs of `node`.
    fn neighbours(&self, node: NodeId) -> Vec<NodeId> {
        let n = self.graph.node(node);
        let mut result = Vec::new();
        for &v in n.inputs() {
            if let Some(p) = self.graph.producer_node(v) {
                if self.graph.is_top_level(p) && !result.contains(&p) {
                    result.push(p);
                }
            }
        }
        for &v in n.outputs() {
            for u in self.graph.value(v).uses() {
                if self.graph.is_top_level(u.node) && !result.contains(&u.node) {
                    result.push(u.node);
                }
            }
        }
        result
    }

    fn can_absorb(&self, id: usize, member: NodeId, candidate: NodeId) -> bool {
        let Some(class) = self.class(candidate) else {
            return false;
        };
        // pooling does not count as an anchor
        if class == OpClass::Primary
            && self.partitions[id]
                .iter()
                .any(|&n| self.class(n) == Some(OpClass::Primary))
        {
            return false;
        }

        // every value linking the two nodes must be crossable
        let links = |producer: NodeId, consumer: NodeId| -> Vec<ValueId> {
            let inputs = self.graph.node(consumer).inputs();
            self.graph
                .node(producer)
                .outputs()
                .iter()
                .copied()
                .filter(|v| inputs.contains(v))
                .collect()
        };
        let mut edges = Vec::new();
        for &m in &self.partitions[id] {
            for v in links(m, candidate) {
                edges.push((m, v, candidate));
            }
            for v in links(candidate, m) {
                edges.push((candidate, v, m));
            }
        }
        let adjacent = edges.iter().any(|&(p, _, u)| p == member || u == member);
        if !adjacent || !edges.iter().all(|&(p, v, u)| self.edge_allowed(p, v, u)) {
            return false;
        }
        !self.creates_cycle(id, candidate)
    }

    fn edge_allowed(&self, producer: NodeId, value: ValueId, consumer: NodeId) -> bool {
        if self.graph.is_block_return(value) {
            return false;
        }
        let all_fusable = self
            .graph
            .value(value)
            .uses()
            .iter()
            .all(|u| self.graph.is_top_level(u.node) && self.class(u.node).is_some());
        if !all_fusable {
            return false;
        }
        let (Some(p), Some(c)) = (self.class(producer), self.class(consumer)) else {
            return false;
        };
        match (p, c) {
            (OpClass::QuantizeActivation, _) => false,
            (OpClass::QuantizeWeight, c) => c == OpClass::Dequantize,
            (_, OpClass::Dequantize) => false,
            _ => true,
        }
    }

    /// True when adding `candidate` lets a path leave the partition and come
    /// back, treating every other partition as a single node.
    fn creates_cycle(&self, id: usize, candidate: NodeId) -> bool {
        let members: FxHashSet<NodeId> = self.partitions[id]
            .iter()
            .copied()
            .chain(std::iter::once(candidate))
            .collect();

        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack: Vec<NodeId> = Vec::new();
        for &m in &members {
            for s in self.successors(m) {
                if !members.contains(&s) {
                    stack.push(s);
                }
            }
        }
        let mut expanded: FxHashSet<usize> = FxHashSet::default();
        while let Some(node) = stack.pop() {
            if members.contains(&node) {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.extend(self.successors(node));
            if let Some(&other) = self.assignment.get(&node) {
                if other != id && expanded.insert(other) {
                    stack.extend(self.partitions[other].iter().copied());
                }
            }
        }
        false
    }

    fn successors(&self, node: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        for &v in self.graph.node(node).outputs() {
            for user in self.graph.top_level_users(v) {
                if !result.contains(&user) {
                    result.push(user);
                }
            }
        }
        result
    }
}

/// Partitions the top block of a graph.
pub fn partition(graph: &Graph) -> Vec<Partition> {
    Partitioner::new(graph).run()
}

// =============================================================================
// Installation
// =============================================================================

/// Replaces each partition with a `fusion_group` node and returns the new nodes.
///
/// Group inputs are ordered by first use inside the partition; group outputs
/// are the member results used outside it or returned, in member order.
pub fn install_fusion_groups(
    graph: &mut Graph,
    partitions: &[Partition],
    compiler: &Arc<dyn KernelCompiler>,
    cache_capacity: usize,
) -> FuseResult<Vec<NodeId>> {
    let mut next_index = graph
        .all_nodes()
        .iter()
        .filter(|&&n| graph.node(n).kind() == OpKind::FusionGroup)
        .count();
    let mut installed = Vec::with_capacity(partitions.len());

    for partition in partitions {
        let members: FxHashSet<NodeId> = partition.nodes().iter().copied().collect();
        let Some(&last) = partition.nodes().last() else {
            continue;
        };

        let mut inputs: Vec<ValueId> = Vec::new();
        let mut outputs: Vec<ValueId> = Vec::new();
        for &n in partition.nodes() {
            for &v in graph.node(n).inputs() {
                let internal = graph.producer_node(v).map_or(false, |p| members.contains(&p));
                if !internal && !inputs.contains(&v) {
                    inputs.push(v);
                }
            }
            for &v in graph.node(n).outputs() {
                let escapes = graph.is_block_return(v)
                    || graph.value(v).uses().iter().any(|u| !members.contains(&u.node));
                if escapes {
                    outputs.push(v);
                }
            }
        }

        let mut subgraph = Graph::new();
        let mut mapping: FxHashMap<ValueId, ValueId> = FxHashMap::default();
        for (i, &v) in inputs.iter().enumerate() {
            let name = graph.value(v).name().map_or_else(|| format!("in{i}"), str::to_string);
            let new = subgraph.add_input(&name, graph.value_type(v).clone());
            mapping.insert(v, new);
        }
        let top = subgraph.top_block();
        for &n in partition.nodes() {
            let node = graph.node(n);
            let ins: Vec<ValueId> = node.inputs().iter().map(|v| mapping[v]).collect();
            let copy = subgraph.append_node(top, node.op.clone(), &ins, node.outputs().len());
            for (&old, &new) in node.outputs().iter().zip(subgraph.node(copy).outputs()) {
                mapping.insert(old, new);
            }
            for &old in node.outputs() {
                subgraph.set_type(mapping[&old], graph.value_type(old).clone());
            }
        }
        subgraph.set_outputs(outputs.iter().map(|v| mapping[v]).collect());

        let op_sequence = partition.kinds(graph);
        let executor = PartitionExecutor::new(Arc::clone(compiler), cache_capacity);
        let group = FusionGroup::new(next_index, subgraph, op_sequence, executor);
        debug!(group = %group.name(), inputs = inputs.len(), outputs = outputs.len(), "fusion group installed");
        next_index += 1;

        let node = graph.insert_after(last, Op::FusionGroup(Arc::new(group)), &inputs, outputs.len());
        for (&old, new) in outputs.iter().zip(graph.node(node).outputs().to_vec()) {
            graph.set_type(new, graph.value_type(old).clone());
            graph.replace_all_uses(old, new);
        }
        for &n in partition.nodes().iter().rev() {
            graph.remove_node(n)?;
        }
        installed.push(node);
    }

    let top = graph.top_block();
    graph.sort_block(top)?;
    Ok(installed)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ReferenceCompiler;
    use crate::interpret::run_graph;
    use crate::propagate::propagate;
    use crate::trace::trace;
    use crate::value::RtValue;
    use onegraph_tensor::kernels::{Conv2dParams, PoolParams};
    use onegraph_tensor::{DType, Tensor};

    fn compiler() -> Arc<dyn KernelCompiler> {
        Arc::new(ReferenceCompiler::new())
    }

    fn conv_params() -> Conv2dParams {
        Conv2dParams::default()
    }

    #[test]
    fn test_chain_forms_one_partition() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[1, 2, 4, 4]);
            let w = t.constant(Tensor::full(&[3, 2, 1, 1], 0.5));
            vec![x.conv2d(&w, None, conv_params()).relu().sigmoid()]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].kinds(&graph), vec![OpKind::Conv2d, OpKind::Relu, OpKind::Sigmoid]);
        assert!(!parts[0].should_rewrite(&graph, false));
        assert!(parts[0].should_rewrite(&graph, true));
    }

    #[test]
    fn test_returned_value_blocks_absorption() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[1, 2, 4, 4]);
            let w = t.constant(Tensor::full(&[2, 2, 1, 1], 0.5));
            let y = x.conv2d(&w, None, conv_params());
            vec![y, y.relu()]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_one_primary_per_partition() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 4]);
            let w1 = t.constant(Tensor::full(&[4, 4], 0.1));
            let w2 = t.constant(Tensor::full(&[3, 4], 0.2));
            vec![x.linear(&w1, None).relu().linear(&w2, None)]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kinds(&graph), vec![OpKind::Linear, OpKind::Relu]);
        assert_eq!(parts[1].kinds(&graph), vec![OpKind::Linear]);
    }

    #[test]
    fn test_pools_join_one_partition() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[1, 3, 4, 4]);
            let params = PoolParams::new(3).stride(1).padding(1);
            vec![x.avg_pool2d(params, false).add(&x.avg_pool2d(params, false))]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0].kinds(&graph),
            vec![OpKind::AvgPool2d, OpKind::AvgPool2d, OpKind::Add]
        );
    }

    #[test]
    fn test_markers_without_compute_are_not_rewritten() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 4]);
            let y = t.input("y", DType::F32, &[2, 3]);
            let q = x.permute(&[1, 0]).quantize_per_tensor(0.1, 0, DType::QInt8);
            let n = x.layer_norm(&[4], None, 1e-5).quantize_per_tensor(0.1, 0, DType::QInt8);
            vec![q.dequantize().matmul(&y), n.dequantize()]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        let kinds: Vec<Vec<OpKind>> = parts.iter().map(|p| p.kinds(&graph)).collect();
        assert_eq!(
            kinds,
            vec![
                vec![OpKind::Permute, OpKind::QuantizePerTensor],
                vec![OpKind::LayerNorm, OpKind::QuantizePerTensor],
                vec![OpKind::Dequantize, OpKind::MatMul],
                vec![OpKind::Dequantize],
            ]
        );
        let rewritten: Vec<bool> = parts.iter().map(|p| p.should_rewrite(&graph, true)).collect();
        assert_eq!(rewritten, vec![false, false, true, false]);
    }

    #[test]
    fn test_cycle_through_other_partition_refused() {
        // add reads `a` directly and through the second matmul, which
        // cannot join the first partition
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 2]);
            let w = t.input("w", DType::F32, &[2, 2]);
            let v = t.input("v", DType::F32, &[2, 2]);
            let a = x.matmul(&w);
            let b = a.relu().matmul(&v);
            vec![a.add(&b)]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        let kinds: Vec<Vec<OpKind>> = parts.iter().map(|p| p.kinds(&graph)).collect();
        assert_eq!(
            kinds,
            vec![vec![OpKind::MatMul, OpKind::Relu], vec![OpKind::MatMul, OpKind::Add]]
        );

        let mut fused = graph.clone();
        install_fusion_groups(&mut fused, &parts, &compiler(), 1).unwrap();
        fused.validate().unwrap();
        assert_eq!(fused.nodes().len(), 2);
    }

    #[test]
    fn test_quantize_ends_and_dequantize_starts() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 2]);
            let y = t.input("y", DType::F32, &[2, 2]);
            let q = x.quantize_per_tensor(0.1, 0, DType::QUInt8);
            vec![q.dequantize().matmul(&y).quantize_per_tensor(0.2, 0, DType::QUInt8)]
        });
        propagate(&mut graph).unwrap();
        let parts = partition(&graph);
        let kinds: Vec<Vec<OpKind>> = parts.iter().map(|p| p.kinds(&graph)).collect();
        assert_eq!(
            kinds,
            vec![
                vec![OpKind::QuantizePerTensor],
                vec![OpKind::Dequantize, OpKind::MatMul, OpKind::QuantizePerTensor],
            ]
        );
        assert!(!parts[0].should_rewrite(&graph, true));
        assert!(parts[1].should_rewrite(&graph, false));
    }

    #[test]
    fn test_install_preserves_results() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[1, 2, 3, 3]);
            let w = t.constant(Tensor::from_vec((0..8).map(|i| i as f32 * 0.1 - 0.3).collect(), &[4, 2, 1, 1]).unwrap());
            let y = x.conv2d(&w, None, conv_params());
            let z = y.relu();
            vec![z.add_scalar(1.0), y.mean(&[2, 3], false)]
        });
        propagate(&mut graph).unwrap();
        let input = vec![RtValue::Tensor(
            Tensor::from_vec((0..18).map(|i| (i as f32 - 9.0) / 4.0).collect(), &[1, 2, 3, 3]).unwrap(),
        )];
        let expected = run_graph(&graph, &input).unwrap();

        let parts = partition(&graph);
        assert_eq!(parts.len(), 1);
        let mut fused = graph.clone();
        let groups = install_fusion_groups(&mut fused, &parts, &compiler(), 1).unwrap();
        assert_eq!(groups.len(), 1);
        fused.validate().unwrap();

        let Op::FusionGroup(group) = &fused.node(groups[0]).op else {
            panic!("expected a fusion group");
        };
        assert_eq!(group.name(), "FusionGroup_0");
        assert_eq!(group.subgraph().inputs().len(), 3);
        assert_eq!(group.subgraph().outputs().len(), 2);

        let actual = run_graph(&fused, &input).unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert_eq!(a.as_tensor().unwrap().to_vec(), e.as_tensor().unwrap().to_vec());
        }
    }
}

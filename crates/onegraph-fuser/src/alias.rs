//! Alias Analysis
//!
//! Groups values that may share tensor storage. Views, inplace results and
//! `if` outputs join the class of the value they may point to. The analysis
//! decides whether an inplace node can be rewritten to its out-of-place
//! form without changing what any later reader observes.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rustc_hash::FxHashMap;

use crate::ir::{Graph, NodeId, Op, Producer, ValueId};

/// May-alias classes over the values of a graph.
#[derive(Debug, Clone)]
pub struct AliasAnalysis {
    class_of: Vec<usize>,
    members: FxHashMap<usize, Vec<ValueId>>,
}

impl AliasAnalysis {
    /// Builds the alias classes of every value in the graph.
    pub fn build(graph: &Graph) -> Self {
        let mut parent: Vec<usize> = (0..graph.num_values()).collect();

        for id in graph.all_nodes() {
            let node = graph.node(id);
            if node.op.may_alias_input() {
                if let (Some(&input), Some(&output)) = (node.inputs().first(), node.outputs().first()) {
                    union(&mut parent, input.index(), output.index());
                }
            }
            if matches!(node.op, Op::If) {
                for &block in node.blocks() {
                    for (&ret, &out) in graph.block_returns(block).iter().zip(node.outputs()) {
                        union(&mut parent, ret.index(), out.index());
                    }
                }
            }
        }

        let class_of: Vec<usize> = (0..parent.len()).map(|i| find(&mut parent, i)).collect();
        let mut members: FxHashMap<usize, Vec<ValueId>> = FxHashMap::default();
        for (i, &root) in class_of.iter().enumerate() {
            members.entry(root).or_default().push(ValueId(i));
        }
        Self { class_of, members }
    }

    /// Returns true if the two values may share storage.
    pub fn may_alias(&self, a: ValueId, b: ValueId) -> bool {
        self.class_of[a.index()] == self.class_of[b.index()]
    }

    /// Returns every value that may share storage with `value`, itself included.
    pub fn aliases(&self, value: ValueId) -> &[ValueId] {
        self.members
            .get(&self.class_of[value.index()])
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns true if the inplace node can be treated as out-of-place.
    ///
    /// The mutation is observable, and therefore unsafe, when an alias of
    /// the mutated base that exists before the node is a graph input, a
    /// constant, a graph output, or is read by a later top-level node.
    pub fn is_inplace_safe(&self, graph: &Graph, node: NodeId) -> bool {
        if !graph.is_top_level(node) {
            return false;
        }
        let n = graph.node(node);
        let (Some(&base), Some(&result)) = (n.inputs().first(), n.outputs().first()) else {
            return false;
        };
        let positions = graph.positions(graph.top_block());
        let Some(&at) = positions.get(&node) else {
            return false;
        };
        let position_of = |id: NodeId| positions.get(&graph.top_level_ancestor(id)).copied();

        for &alias in self.aliases(base) {
            if alias == result {
                continue;
            }
            match graph.value(alias).producer() {
                Producer::Input(_) => return false,
                Producer::Node { node: producer, .. } => {
                    if matches!(graph.node(producer).op, Op::Constant(_)) {
                        return false;
                    }
                    if position_of(producer).map_or(true, |p| p >= at) {
                        continue;
                    }
                }
            }
            if graph.is_graph_output(alias) {
                return false;
            }
            let read_later = graph
                .value(alias)
                .uses()
                .iter()
                .filter(|u| u.node != node)
                .any(|u| position_of(u.node).map_or(true, |p| p > at));
            if read_later {
                return false;
            }
        }
        true
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}

// =============================================================================
// Tests
// =============================================================================

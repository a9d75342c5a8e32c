//! Fusion Groups
//!
//! A fusion group is the body of a `fusion_group` node: an owned subgraph
//! whose inputs and outputs match the node's edges, the operator sequence
//! it was formed from, and the executor that compiles and runs it.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use crate::error::FuseResult;
use crate::interpret::run_graph;
use crate::ir::{Graph, OpKind, ValueType};
use crate::runtime::PartitionExecutor;
use crate::value::RtValue;

/// A fused partition installed in a graph.
#[derive(Debug)]
pub struct FusionGroup {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) subgraph: Graph,
    pub(crate) op_sequence: Vec<OpKind>,
    pub(crate) executor: PartitionExecutor,
}

impl FusionGroup {
    /// Creates group `index` from its subgraph.
    pub fn new(index: usize, subgraph: Graph, op_sequence: Vec<OpKind>, executor: PartitionExecutor) -> Self {
        Self {
            name: format!("FusionGroup_{index}"),
            index,
            subgraph,
            op_sequence,
            executor,
        }
    }

    /// Returns the group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the creation index of the group within its graph.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the fused subgraph.
    pub fn subgraph(&self) -> &Graph {
        &self.subgraph
    }

    /// Returns the operator kinds of the subgraph in execution order.
    pub fn op_sequence(&self) -> &[OpKind] {
        &self.op_sequence
    }

    /// Returns the executor.
    pub fn executor(&self) -> &PartitionExecutor {
        &self.executor
    }

    /// Returns the declared input types.
    pub fn input_types(&self) -> Vec<ValueType> {
        self.subgraph
            .inputs()
            .iter()
            .map(|&v| self.subgraph.value_type(v).clone())
            .collect()
    }

    /// Returns the declared output types.
    pub fn output_types(&self) -> Vec<ValueType> {
        self.subgraph
            .outputs()
            .iter()
            .map(|&v| self.subgraph.value_type(v).clone())
            .collect()
    }

    /// Runs the group through its executor.
    pub fn run(&self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        self.executor.run(self, inputs)
    }

    /// Runs the subgraph with the reference interpreter, bypassing the executor.
    pub fn run_reference(&self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        run_graph(&self.subgraph, inputs)
    }
}

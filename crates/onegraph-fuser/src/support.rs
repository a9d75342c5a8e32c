//! Backend Support Declaration
//!
//! Decides, per node, whether the backend can take it into a partition and
//! which role it plays there. Nodes the backend cannot take are wildcards:
//! they stay in the graph and run on the generic path, and values they
//! consume never become partition internals.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;

use onegraph_tensor::DType;
use serde::{Deserialize, Serialize};

use crate::ir::{Graph, NodeId, Op, ValueType};

/// Dtypes the backend accepts on partition edges.
pub const SUPPORTED_DTYPES: [DType; 4] = [DType::F32, DType::BF16, DType::QInt8, DType::QUInt8];

// =============================================================================
// Classes
// =============================================================================

/// Role of a fusable node inside a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpClass {
    /// Compute-heavy anchor; at most one per partition.
    Primary,
    /// Pooling; joins any partition, including one with an anchor.
    Pool,
    /// Normalization, reduction or concatenation attached to an anchor.
    Secondary,
    /// Elementwise unary or clamp.
    Eltwise,
    /// Elementwise binary.
    Binary,
    /// Layout-only operator.
    Shape,
    /// Precision cast between f32 and bf16.
    Cast,
    /// Quantize of a runtime value; ends a partition.
    QuantizeActivation,
    /// Quantize of a constant; stays with its dequantize.
    QuantizeWeight,
    /// Dequantize; starts a partition.
    Dequantize,
}

impl OpClass {
    /// Returns true for classes that carry the compute of a partition.
    #[must_use]
    pub fn is_compute(self) -> bool {
        matches!(self, Self::Primary | Self::Pool)
    }

    /// Returns true for quantize and dequantize classes.
    #[must_use]
    pub fn is_quant_marker(self) -> bool {
        matches!(self, Self::QuantizeActivation | Self::QuantizeWeight | Self::Dequantize)
    }
}

/// Backend verdict for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    /// The node may join a partition in the given role.
    Fusable(OpClass),
    /// The node stays outside every partition.
    Wildcard(&'static str),
}

impl Support {
    /// Returns the class of a fusable node.
    pub fn class(self) -> Option<OpClass> {
        match self {
            Self::Fusable(class) => Some(class),
            Self::Wildcard(_) => None,
        }
    }

    /// Returns true for fusable nodes.
    pub fn is_fusable(self) -> bool {
        matches!(self, Self::Fusable(_))
    }
}

impl fmt::Display for Support {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fusable(class) => write!(f, "fusable as {class:?}"),
            Self::Wildcard(reason) => write!(f, "wildcard: {reason}"),
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

fn supported_tensor(ty: &ValueType) -> Result<(), &'static str> {
    match ty {
        ValueType::Tensor(t) if t.shape.is_none() => Err("unknown shape"),
        ValueType::Tensor(t) if !SUPPORTED_DTYPES.contains(&t.dtype) => Err("unsupported dtype"),
        ValueType::Tensor(_) => Ok(()),
        ValueType::Float | ValueType::Int | ValueType::Bool => Ok(()),
        _ => Err("unknown type"),
    }
}

/// Classifies a node for the partitioner.
pub fn classify(graph: &Graph, node: NodeId) -> Support {
    use Support::{Fusable, Wildcard};

    if !graph.is_top_level(node) {
        return Wildcard("inside a control flow block");
    }
    let n = graph.node(node);
    if n.op.is_inplace() {
        return Wildcard("inplace with observable aliases");
    }

    let class = match &n.op {
        Op::Constant(_) | Op::ListConstruct | Op::Size { .. } => return Wildcard("no compute"),
        Op::If => return Wildcard("control flow"),
        Op::FusionGroup(_) => return Wildcard("already fused"),
        Op::Select { .. } => return Wildcard("select is not supported"),
        Op::AdaptiveAvgPool2d { .. } => return Wildcard("adaptive pooling is not supported"),

        Op::Conv2d(_) | Op::Linear | Op::MatMul | Op::Bmm => OpClass::Primary,
        Op::MaxPool2d(_) | Op::AvgPool2d { .. } => OpClass::Pool,
        Op::LayerNorm {
            normalized_shape: None, ..
        } => return Wildcard("dynamic normalized shape"),
        Op::BatchNorm { .. } | Op::LayerNorm { .. } | Op::Softmax { .. } | Op::Mean { .. } | Op::Cat { .. } => {
            OpClass::Secondary
        }
        Op::Unary { .. } | Op::Clamp { .. } => OpClass::Eltwise,
        Op::Binary { .. } => {
            let any_tensor = n.inputs().iter().any(|&v| graph.tensor_type(v).is_some());
            if !any_tensor {
                return Wildcard("binary without tensor operand");
            }
            OpClass::Binary
        }
        Op::View { shape: None } | Op::Reshape { shape: None } => return Wildcard("dynamic target shape"),
        Op::View { .. } | Op::Reshape { .. } | Op::Permute { .. } | Op::Transpose { .. } => OpClass::Shape,
        Op::Contiguous { layout } => {
            let unchanged = n
                .inputs()
                .first()
                .and_then(|&v| graph.tensor_type(v))
                .map_or(true, |t| t.layout == *layout);
            if unchanged {
                return Wildcard("contiguous keeps the layout");
            }
            OpClass::Shape
        }
        Op::To { dtype } => {
            let from = n.inputs().first().and_then(|&v| graph.tensor_type(v)).map(|t| t.dtype);
            match (from, dtype) {
                (Some(DType::F32), DType::BF16) | (Some(DType::BF16), DType::F32) => OpClass::Cast,
                _ => return Wildcard("cast other than f32 and bf16"),
            }
        }
        Op::QuantizePerTensor { .. } | Op::QuantizePerChannel { .. } => {
            let weight = n.inputs().first().and_then(|&v| graph.constant_value(v)).is_some();
            if weight {
                OpClass::QuantizeWeight
            } else {
                OpClass::QuantizeActivation
            }
        }
        Op::Dequantize => OpClass::Dequantize,
    };

    for &v in n.inputs().iter().chain(n.outputs()) {
        if let Err(reason) = supported_tensor(graph.value_type(v)) {
            return Wildcard(reason);
        }
    }
    Fusable(class)
}

// =============================================================================
// Tests
// =============================================================================

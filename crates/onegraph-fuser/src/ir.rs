//! Intermediate Representation
//!
//! Arena-indexed dataflow graph of typed values and operator nodes. Every
//! value has exactly one producer (a graph input or a node output) and a
//! list of uses. Nodes live in ordered blocks; the top block holds the graph
//! body and `If` nodes own one nested block per branch. Rewrites create new
//! arena entries and repoint edges, so ids stay stable for the life of the
//! graph.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use onegraph_tensor::kernels::{BinaryOp, Conv2dParams, PoolParams, UnaryOp};
use onegraph_tensor::{DType, Layout, Shape, Tensor};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{FuseError, FuseResult};
use crate::group::FusionGroup;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Unique identifier for a value in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) usize);

/// Unique identifier for a block in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) usize);

impl NodeId {
    /// Returns the raw index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl ValueId {
    /// Returns the raw index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

// =============================================================================
// Value Types
// =============================================================================

/// Inferred type of a tensor value.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorType {
    /// Element dtype.
    pub dtype: DType,
    /// Concrete dimensions, or `None` when inference could not determine them.
    pub shape: Option<Shape>,
    /// Memory layout tag.
    pub layout: Layout,
}

impl TensorType {
    /// Creates a contiguous tensor type with a known shape.
    #[must_use]
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: Some(Shape::from_slice(shape)),
            layout: Layout::Contiguous,
        }
    }

    /// Creates a tensor type whose shape is unknown.
    #[must_use]
    pub fn unknown_shape(dtype: DType) -> Self {
        Self {
            dtype,
            shape: None,
            layout: Layout::Contiguous,
        }
    }

    /// Returns the type with a different layout tag.
    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Returns the type with a different dtype.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Returns the rank when the shape is known.
    #[must_use]
    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.len())
    }
}

/// Inferred type of any graph value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    /// Not yet inferred.
    Unknown,
    /// A tensor.
    Tensor(TensorType),
    /// A float scalar.
    Float,
    /// An integer scalar.
    Int,
    /// A boolean scalar.
    Bool,
    /// A list of integers, such as a shape.
    IntList,
    /// A heterogeneous list.
    List,
    /// The absent value.
    None,
}

impl ValueType {
    /// Shorthand for a contiguous tensor type.
    #[must_use]
    pub fn tensor(dtype: DType, shape: &[usize]) -> Self {
        Self::Tensor(TensorType::new(dtype, shape))
    }

    /// Returns the tensor type, if this is a tensor.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Returns true for scalar number types.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Float | Self::Int | Self::Bool)
    }
}

// =============================================================================
// Constants
// =============================================================================

/// Value held by a constant node.
#[derive(Debug, Clone)]
pub enum ConstValue {
    /// A tensor such as a weight.
    Tensor(Tensor),
    /// A float scalar.
    Float(f64),
    /// An integer scalar.
    Int(i64),
    /// A boolean scalar.
    Bool(bool),
    /// An integer list.
    Ints(Vec<i64>),
    /// The absent value.
    None,
}

impl ConstValue {
    /// Returns the type of the constant.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Tensor(t) => ValueType::Tensor(TensorType {
                dtype: t.dtype(),
                shape: Some(Shape::from_slice(t.shape())),
                layout: t.layout(),
            }),
            Self::Float(_) => ValueType::Float,
            Self::Int(_) => ValueType::Int,
            Self::Bool(_) => ValueType::Bool,
            Self::Ints(_) => ValueType::IntList,
            Self::None => ValueType::None,
        }
    }

    /// Returns the numeric value of a scalar constant.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

// =============================================================================
// Operators
// =============================================================================

/// Operators of the graph IR with their static attributes.
#[derive(Debug, Clone)]
pub enum Op {
    /// Constant value; no inputs.
    Constant(ConstValue),
    /// 2-d convolution: input, weight, optional bias.
    Conv2d(Conv2dParams),
    /// Linear layer: input, weight `[out, in]`, optional bias.
    Linear,
    /// Broadcasting matrix product.
    MatMul,
    /// Batched matrix product of 3-d tensors.
    Bmm,
    /// Inference batch norm: input, mean, var, weight, bias.
    BatchNorm {
        /// Variance epsilon.
        eps: f32,
    },
    /// Layer norm: input, optional weight, optional bias; with no static
    /// shape the normalized shape is read from input 1 at runtime.
    LayerNorm {
        /// Static normalized shape.
        normalized_shape: Option<Vec<usize>>,
        /// Variance epsilon.
        eps: f32,
    },
    /// Softmax along a dimension.
    Softmax {
        /// Reduction dimension.
        dim: i64,
    },
    /// Mean over dimensions.
    Mean {
        /// Reduced dimensions.
        dims: Vec<i64>,
        /// Keep reduced dimensions with size 1.
        keepdim: bool,
    },
    /// Concatenation of all tensor inputs.
    Cat {
        /// Concatenation dimension.
        dim: i64,
    },
    /// 2-d max pooling.
    MaxPool2d(PoolParams),
    /// 2-d average pooling.
    AvgPool2d {
        /// Window attributes.
        params: PoolParams,
        /// Count padded positions in the divisor.
        count_include_pad: bool,
    },
    /// Adaptive average pooling.
    AdaptiveAvgPool2d {
        /// Output spatial size.
        output_size: [usize; 2],
    },
    /// Elementwise unary operator.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// Writes the result into its input.
        inplace: bool,
    },
    /// Clamp to optional bounds.
    Clamp {
        /// Lower bound.
        min: Option<f32>,
        /// Upper bound.
        max: Option<f32>,
        /// Writes the result into its input.
        inplace: bool,
    },
    /// Binary operator; either operand may be a scalar.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Writes the result into the left operand.
        inplace: bool,
    },
    /// Aliasing reshape of a contiguous tensor; without a static shape the
    /// target is read from input 1 at runtime.
    View {
        /// Static target shape.
        shape: Option<Vec<i64>>,
    },
    /// Reshape that copies when a view is impossible.
    Reshape {
        /// Static target shape.
        shape: Option<Vec<i64>>,
    },
    /// Dimension permutation view.
    Permute {
        /// New dimension order.
        dims: Vec<usize>,
    },
    /// Two-dimension swap view.
    Transpose {
        /// First dimension.
        dim0: i64,
        /// Second dimension.
        dim1: i64,
    },
    /// Dense copy in the requested memory layout.
    Contiguous {
        /// Target layout.
        layout: Layout,
    },
    /// Index view along one dimension.
    Select {
        /// Dimension.
        dim: i64,
        /// Index.
        index: i64,
    },
    /// Runtime size query; all dimensions when `dim` is `None`.
    Size {
        /// Queried dimension.
        dim: Option<i64>,
    },
    /// Packs inputs into a list.
    ListConstruct,
    /// Precision cast.
    To {
        /// Target dtype.
        dtype: DType,
    },
    /// Per-tensor affine quantization.
    QuantizePerTensor {
        /// Scale.
        scale: f32,
        /// Zero point.
        zero_point: i32,
        /// Narrow dtype.
        dtype: DType,
    },
    /// Per-channel affine quantization.
    QuantizePerChannel {
        /// Per-channel scales.
        scales: Vec<f32>,
        /// Per-channel zero points.
        zero_points: Vec<i32>,
        /// Channel axis.
        axis: usize,
        /// Narrow dtype.
        dtype: DType,
    },
    /// Conversion of a quantized tensor back to f32.
    Dequantize,
    /// Two-way branch on input 0; owns a then block and an else block.
    If,
    /// Opaque fused subgraph.
    FusionGroup(Arc<FusionGroup>),
}

/// Operator symbol without attributes, used for queries and patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum OpKind {
    Constant,
    Conv2d,
    Linear,
    MatMul,
    Bmm,
    BatchNorm,
    LayerNorm,
    Softmax,
    Mean,
    Cat,
    MaxPool2d,
    AvgPool2d,
    AdaptiveAvgPool2d,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Silu,
    Mish,
    Elu,
    LeakyRelu,
    Hardswish,
    Hardsigmoid,
    Hardtanh,
    Round,
    Abs,
    Square,
    Exp,
    Log,
    Sqrt,
    Neg,
    Clamp,
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Gt,
    View,
    Reshape,
    Permute,
    Transpose,
    Contiguous,
    Select,
    Size,
    ListConstruct,
    To,
    QuantizePerTensor,
    QuantizePerChannel,
    Dequantize,
    If,
    FusionGroup,
}

impl OpKind {
    /// Returns the operator name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Conv2d => "conv2d",
            Self::Linear => "linear",
            Self::MatMul => "matmul",
            Self::Bmm => "bmm",
            Self::BatchNorm => "batch_norm",
            Self::LayerNorm => "layer_norm",
            Self::Softmax => "softmax",
            Self::Mean => "mean",
            Self::Cat => "cat",
            Self::MaxPool2d => "max_pool2d",
            Self::AvgPool2d => "avg_pool2d",
            Self::AdaptiveAvgPool2d => "adaptive_avg_pool2d",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Gelu => "gelu",
            Self::Silu => "silu",
            Self::Mish => "mish",
            Self::Elu => "elu",
            Self::LeakyRelu => "leaky_relu",
            Self::Hardswish => "hardswish",
            Self::Hardsigmoid => "hardsigmoid",
            Self::Hardtanh => "hardtanh",
            Self::Round => "round",
            Self::Abs => "abs",
            Self::Square => "square",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Neg => "neg",
            Self::Clamp => "clamp",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Maximum => "maximum",
            Self::Gt => "gt",
            Self::View => "view",
            Self::Reshape => "reshape",
            Self::Permute => "permute",
            Self::Transpose => "transpose",
            Self::Contiguous => "contiguous",
            Self::Select => "select",
            Self::Size => "size",
            Self::ListConstruct => "list_construct",
            Self::To => "to",
            Self::QuantizePerTensor => "quantize_per_tensor",
            Self::QuantizePerChannel => "quantize_per_channel",
            Self::Dequantize => "dequantize",
            Self::If => "if",
            Self::FusionGroup => "fusion_group",
        }
    }

    /// Returns true for quantize and dequantize markers.
    #[must_use]
    pub fn is_quant_marker(self) -> bool {
        matches!(
            self,
            Self::QuantizePerTensor | Self::QuantizePerChannel | Self::Dequantize
        )
    }

    fn from_unary(op: UnaryOp) -> Self {
        match op {
            UnaryOp::Relu => Self::Relu,
            UnaryOp::Sigmoid => Self::Sigmoid,
            UnaryOp::Tanh => Self::Tanh,
            UnaryOp::Gelu => Self::Gelu,
            UnaryOp::Silu => Self::Silu,
            UnaryOp::Mish => Self::Mish,
            UnaryOp::Elu { .. } => Self::Elu,
            UnaryOp::LeakyRelu { .. } => Self::LeakyRelu,
            UnaryOp::Hardswish => Self::Hardswish,
            UnaryOp::Hardsigmoid => Self::Hardsigmoid,
            UnaryOp::Hardtanh { .. } => Self::Hardtanh,
            UnaryOp::Round => Self::Round,
            UnaryOp::Abs => Self::Abs,
            UnaryOp::Square => Self::Square,
            UnaryOp::Exp => Self::Exp,
            UnaryOp::Log => Self::Log,
            UnaryOp::Sqrt => Self::Sqrt,
            UnaryOp::Neg => Self::Neg,
        }
    }

    fn from_binary(op: BinaryOp) -> Self {
        match op {
            BinaryOp::Add => Self::Add,
            BinaryOp::Sub => Self::Sub,
            BinaryOp::Mul => Self::Mul,
            BinaryOp::Div => Self::Div,
            BinaryOp::Maximum => Self::Maximum,
            BinaryOp::Gt => Self::Gt,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Op {
    /// Returns the attribute-free operator symbol.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Constant(_) => OpKind::Constant,
            Self::Conv2d(_) => OpKind::Conv2d,
            Self::Linear => OpKind::Linear,
            Self::MatMul => OpKind::MatMul,
            Self::Bmm => OpKind::Bmm,
            Self::BatchNorm { .. } => OpKind::BatchNorm,
            Self::LayerNorm { .. } => OpKind::LayerNorm,
            Self::Softmax { .. } => OpKind::Softmax,
            Self::Mean { .. } => OpKind::Mean,
            Self::Cat { .. } => OpKind::Cat,
            Self::MaxPool2d(_) => OpKind::MaxPool2d,
            Self::AvgPool2d { .. } => OpKind::AvgPool2d,
            Self::AdaptiveAvgPool2d { .. } => OpKind::AdaptiveAvgPool2d,
            Self::Unary { op, .. } => OpKind::from_unary(*op),
            Self::Clamp { .. } => OpKind::Clamp,
            Self::Binary { op, .. } => OpKind::from_binary(*op),
            Self::View { .. } => OpKind::View,
            Self::Reshape { .. } => OpKind::Reshape,
            Self::Permute { .. } => OpKind::Permute,
            Self::Transpose { .. } => OpKind::Transpose,
            Self::Contiguous { .. } => OpKind::Contiguous,
            Self::Select { .. } => OpKind::Select,
            Self::Size { .. } => OpKind::Size,
            Self::ListConstruct => OpKind::ListConstruct,
            Self::To { .. } => OpKind::To,
            Self::QuantizePerTensor { .. } => OpKind::QuantizePerTensor,
            Self::QuantizePerChannel { .. } => OpKind::QuantizePerChannel,
            Self::Dequantize => OpKind::Dequantize,
            Self::If => OpKind::If,
            Self::FusionGroup(_) => OpKind::FusionGroup,
        }
    }

    /// Returns the operator name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Returns true if the operator writes its result into input 0.
    #[must_use]
    pub fn is_inplace(&self) -> bool {
        matches!(
            self,
            Self::Unary { inplace: true, .. }
                | Self::Clamp { inplace: true, .. }
                | Self::Binary { inplace: true, .. }
        )
    }

    /// Returns the out-of-place form of an inplace operator.
    #[must_use]
    pub fn out_of_place(&self) -> Self {
        match self {
            Self::Unary { op, .. } => Self::Unary {
                op: *op,
                inplace: false,
            },
            Self::Clamp { min, max, .. } => Self::Clamp {
                min: *min,
                max: *max,
                inplace: false,
            },
            Self::Binary { op, .. } => Self::Binary {
                op: *op,
                inplace: false,
            },
            other => other.clone(),
        }
    }

    /// Returns true if output 0 may share storage with input 0.
    #[must_use]
    pub fn may_alias_input(&self) -> bool {
        self.is_inplace()
            || matches!(
                self,
                Self::View { .. }
                    | Self::Reshape { .. }
                    | Self::Permute { .. }
                    | Self::Transpose { .. }
                    | Self::Contiguous { .. }
                    | Self::Select { .. }
            )
    }

    /// Returns true for operators that only rearrange elements and keep
    /// every value unchanged.
    #[must_use]
    pub fn is_shape_preserving_view(&self) -> bool {
        matches!(
            self,
            Self::View { shape: Some(_) }
                | Self::Reshape { shape: Some(_) }
                | Self::Permute { .. }
                | Self::Transpose { .. }
        )
    }
}

// =============================================================================
// Nodes, Values and Blocks
// =============================================================================

/// Origin of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    /// Graph input at the given position.
    Input(usize),
    /// Output `index` of a node.
    Node {
        /// Producing node.
        node: NodeId,
        /// Output position.
        index: usize,
    },
}

/// One consumption of a value by a node input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    /// Consuming node.
    pub node: NodeId,
    /// Input position on the consuming node.
    pub index: usize,
}

/// A typed value edge.
#[derive(Debug, Clone)]
pub struct Value {
    id: ValueId,
    /// Inferred type.
    pub ty: ValueType,
    producer: Producer,
    uses: Vec<Use>,
    name: Option<String>,
}

impl Value {
    /// Returns the value id.
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// Returns the producer.
    pub fn producer(&self) -> Producer {
        self.producer
    }

    /// Returns the uses of this value by node inputs.
    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    /// Returns the debug name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Operand list of a node; most operators take at most four.
pub type Operands = SmallVec<[ValueId; 4]>;

/// An operator application.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    /// Operator and attributes.
    pub op: Op,
    inputs: Operands,
    outputs: SmallVec<[ValueId; 1]>,
    blocks: Vec<BlockId>,
    owner: BlockId,
    alive: bool,
}

impl Node {
    /// Returns the node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the ordered inputs.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Returns the ordered outputs.
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Returns the nested blocks (then, else for `If`).
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Returns the block that contains this node.
    pub fn owner(&self) -> BlockId {
        self.owner
    }

    /// Returns the operator symbol.
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

#[derive(Debug, Clone, Default)]
struct Block {
    nodes: Vec<NodeId>,
    returns: Vec<ValueId>,
    owner: Option<NodeId>,
}

// =============================================================================
// Graph
// =============================================================================

/// A mutable dataflow graph.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    values: Vec<Value>,
    blocks: Vec<Block>,
    inputs: Vec<ValueId>,
}

impl Graph {
    /// Creates an empty graph with a top block.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            values: Vec::new(),
            blocks: vec![Block::default()],
            inputs: Vec::new(),
        }
    }

    /// Returns the top block.
    pub fn top_block(&self) -> BlockId {
        BlockId(0)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Adds a graph input.
    pub fn add_input(&mut self, name: &str, ty: ValueType) -> ValueId {
        let index = self.inputs.len();
        let id = self.new_value(Producer::Input(index), ty);
        self.values[id.0].name = Some(name.to_string());
        self.inputs.push(id);
        id
    }

    fn new_value(&mut self, producer: Producer, ty: ValueType) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            id,
            ty,
            producer,
            uses: Vec::new(),
            name: None,
        });
        id
    }

    fn create_node(&mut self, block: BlockId, op: Op, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        let ty = match &op {
            Op::Constant(value) => value.value_type(),
            _ => ValueType::Unknown,
        };
        let outputs = (0..num_outputs)
            .map(|index| self.new_value(Producer::Node { node: id, index }, ty.clone()))
            .collect();
        for (index, &input) in inputs.iter().enumerate() {
            self.values[input.0].uses.push(Use { node: id, index });
        }
        self.nodes.push(Node {
            id,
            op,
            inputs: SmallVec::from_slice(inputs),
            outputs,
            blocks: Vec::new(),
            owner: block,
            alive: true,
        });
        id
    }

    /// Appends a node at the end of a block.
    pub fn append_node(&mut self, block: BlockId, op: Op, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let id = self.create_node(block, op, inputs, num_outputs);
        self.blocks[block.0].nodes.push(id);
        id
    }

    /// Inserts a node immediately before `anchor` in the anchor's block.
    pub fn insert_before(&mut self, anchor: NodeId, op: Op, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let block = self.nodes[anchor.0].owner;
        let id = self.create_node(block, op, inputs, num_outputs);
        let nodes = &mut self.blocks[block.0].nodes;
        let pos = nodes.iter().position(|&n| n == anchor).unwrap_or(nodes.len());
        nodes.insert(pos, id);
        id
    }

    /// Inserts a node immediately after `anchor` in the anchor's block.
    pub fn insert_after(&mut self, anchor: NodeId, op: Op, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let block = self.nodes[anchor.0].owner;
        let id = self.create_node(block, op, inputs, num_outputs);
        let nodes = &mut self.blocks[block.0].nodes;
        let pos = nodes.iter().position(|&n| n == anchor).map_or(nodes.len(), |p| p + 1);
        nodes.insert(pos, id);
        id
    }

    /// Inserts a node at the start of the top block.
    pub fn prepend_node(&mut self, op: Op, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let id = self.create_node(BlockId(0), op, inputs, num_outputs);
        self.blocks[0].nodes.insert(0, id);
        id
    }

    /// Appends a fresh output value to an existing node.
    pub fn add_output(&mut self, node: NodeId) -> ValueId {
        let index = self.nodes[node.0].outputs.len();
        let id = self.new_value(Producer::Node { node, index }, ValueType::Unknown);
        self.nodes[node.0].outputs.push(id);
        id
    }

    /// Creates a nested block owned by `owner`.
    pub fn add_block(&mut self, owner: NodeId) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block {
            owner: Some(owner),
            ..Block::default()
        });
        self.nodes[owner.0].blocks.push(id);
        id
    }

    /// Sets the values returned by a block; the top block returns the graph outputs.
    pub fn set_block_returns(&mut self, block: BlockId, returns: Vec<ValueId>) {
        self.blocks[block.0].returns = returns;
    }

    /// Sets the graph outputs.
    pub fn set_outputs(&mut self, outputs: Vec<ValueId>) {
        self.set_block_returns(BlockId(0), outputs);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Returns true if the node has not been removed.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).map_or(false, |n| n.alive)
    }

    /// Returns a value.
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    /// Returns the inferred type of a value.
    pub fn value_type(&self, id: ValueId) -> &ValueType {
        &self.values[id.0].ty
    }

    /// Returns the tensor type of a value, if it is a tensor.
    pub fn tensor_type(&self, id: ValueId) -> Option<&TensorType> {
        self.values[id.0].ty.as_tensor()
    }

    /// Sets the inferred type of a value.
    pub fn set_type(&mut self, id: ValueId, ty: ValueType) {
        self.values[id.0].ty = ty;
    }

    /// Replaces a node's operator, keeping its edges.
    pub fn set_op(&mut self, id: NodeId, op: Op) {
        self.nodes[id.0].op = op;
    }

    /// Returns the graph inputs.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Returns the graph outputs.
    pub fn outputs(&self) -> &[ValueId] {
        &self.blocks[0].returns
    }

    /// Returns the nodes of a block in order.
    pub fn block_nodes(&self, block: BlockId) -> &[NodeId] {
        &self.blocks[block.0].nodes
    }

    /// Returns the values returned by a block.
    pub fn block_returns(&self, block: BlockId) -> &[ValueId] {
        &self.blocks[block.0].returns
    }

    /// Returns the node owning a nested block.
    pub fn block_owner(&self, block: BlockId) -> Option<NodeId> {
        self.blocks[block.0].owner
    }

    /// Returns the top-level nodes in order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.blocks[0].nodes
    }

    /// Returns all live nodes, nested blocks included, in pre-order.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut result = Vec::new();
        self.collect_nodes(BlockId(0), &mut result);
        result
    }

    fn collect_nodes(&self, block: BlockId, out: &mut Vec<NodeId>) {
        for &n in &self.blocks[block.0].nodes {
            out.push(n);
            for &b in &self.nodes[n.0].blocks {
                self.collect_nodes(b, out);
            }
        }
    }

    /// Returns the number of values ever created, dead ones included.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Returns the number of live nodes, nested blocks included.
    pub fn len(&self) -> usize {
        self.all_nodes().len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the node that produces a value.
    pub fn producer_node(&self, value: ValueId) -> Option<NodeId> {
        match self.values[value.0].producer {
            Producer::Node { node, .. } => Some(node),
            Producer::Input(_) => None,
        }
    }

    /// Returns the constant held by the producer of a value.
    pub fn constant_value(&self, value: ValueId) -> Option<&ConstValue> {
        let node = self.producer_node(value)?;
        match &self.nodes[node.0].op {
            Op::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// Returns true if a value is returned by the graph.
    pub fn is_graph_output(&self, value: ValueId) -> bool {
        self.blocks[0].returns.contains(&value)
    }

    /// Returns true if any block returns the value.
    pub fn is_block_return(&self, value: ValueId) -> bool {
        self.blocks.iter().any(|b| b.returns.contains(&value))
    }

    /// Returns true if the node sits directly in the top block.
    pub fn is_top_level(&self, node: NodeId) -> bool {
        self.nodes[node.0].owner == BlockId(0)
    }

    /// Returns the top-level node that contains `node`.
    pub fn top_level_ancestor(&self, mut node: NodeId) -> NodeId {
        while let Some(owner) = self.blocks[self.nodes[node.0].owner.0].owner {
            node = owner;
        }
        node
    }

    /// Returns the position of every node in a block.
    pub fn positions(&self, block: BlockId) -> FxHashMap<NodeId, usize> {
        self.blocks[block.0]
            .nodes
            .iter()
            .enumerate()
            .map(|(i, &n)| (n, i))
            .collect()
    }

    /// Returns the distinct top-level consumers of a value; uses inside
    /// nested blocks are attributed to their enclosing top-level node.
    pub fn top_level_users(&self, value: ValueId) -> Vec<NodeId> {
        let mut users = Vec::new();
        for u in &self.values[value.0].uses {
            let top = self.top_level_ancestor(u.node);
            if !users.contains(&top) {
                users.push(top);
            }
        }
        users
    }

    // =========================================================================
    // Rewriting
    // =========================================================================

    fn remove_use(&mut self, value: ValueId, target: Use) {
        let uses = &mut self.values[value.0].uses;
        if let Some(pos) = uses.iter().position(|u| *u == target) {
            uses.remove(pos);
        }
    }

    /// Repoints one input of a node.
    pub fn set_input(&mut self, node: NodeId, index: usize, value: ValueId) {
        let old = self.nodes[node.0].inputs[index];
        self.remove_use(old, Use { node, index });
        self.nodes[node.0].inputs[index] = value;
        self.values[value.0].uses.push(Use { node, index });
    }

    /// Repoints every use of `old`, including block returns, to `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old.0].uses);
        for u in &uses {
            self.nodes[u.node.0].inputs[u.index] = new;
        }
        self.values[new.0].uses.extend(uses);
        for block in &mut self.blocks {
            for r in &mut block.returns {
                if *r == old {
                    *r = new;
                }
            }
        }
    }

    /// Removes a node whose outputs are unused.
    pub fn remove_node(&mut self, id: NodeId) -> FuseResult<()> {
        for &out in &self.nodes[id.0].outputs {
            if !self.values[out.0].uses.is_empty() || self.is_block_return(out) {
                return Err(FuseError::invalid_graph(format!(
                    "cannot remove {} node {}: output {out} is still used",
                    self.nodes[id.0].op.name(),
                    id.0
                )));
            }
        }
        let inputs = self.nodes[id.0].inputs.clone();
        for (index, input) in inputs.into_iter().enumerate() {
            self.remove_use(input, Use { node: id, index });
        }
        for block in self.nodes[id.0].blocks.clone() {
            for n in self.blocks[block.0].nodes.clone().into_iter().rev() {
                self.detach(n);
            }
            self.blocks[block.0].returns.clear();
        }
        let owner = self.nodes[id.0].owner;
        self.blocks[owner.0].nodes.retain(|&n| n != id);
        self.nodes[id.0].alive = false;
        Ok(())
    }

    fn detach(&mut self, id: NodeId) {
        let inputs = self.nodes[id.0].inputs.clone();
        for (index, input) in inputs.into_iter().enumerate() {
            self.remove_use(input, Use { node: id, index });
        }
        self.nodes[id.0].alive = false;
    }

    /// Values used by a node and everything nested inside it.
    fn free_inputs(&self, node: NodeId, out: &mut Vec<ValueId>) {
        out.extend_from_slice(&self.nodes[node.0].inputs);
        for &b in &self.nodes[node.0].blocks {
            for &n in &self.blocks[b.0].nodes {
                self.free_inputs(n, out);
            }
            out.extend_from_slice(&self.blocks[b.0].returns);
        }
    }

    /// Reorders a block topologically, keeping the existing order wherever
    /// dependencies allow.
    pub fn sort_block(&mut self, block: BlockId) -> FuseResult<()> {
        let order = self.blocks[block.0].nodes.clone();
        let pos: FxHashMap<NodeId, usize> = order.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut indegree = vec![0usize; order.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
        for (i, &n) in order.iter().enumerate() {
            let mut used = Vec::new();
            self.free_inputs(n, &mut used);
            let mut deps = FxHashSet::default();
            for v in used {
                if let Some(p) = self.producer_node(v) {
                    let p = self.ancestor_in_block(p, block);
                    if let Some(&j) = p.and_then(|p| pos.get(&p)) {
                        if j != i {
                            deps.insert(j);
                        }
                    }
                }
            }
            indegree[i] = deps.len();
            for j in deps {
                dependents[j].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut sorted = Vec::with_capacity(order.len());
        while let Some(Reverse(i)) = ready.pop() {
            sorted.push(order[i]);
            for &k in &dependents[i] {
                indegree[k] -= 1;
                if indegree[k] == 0 {
                    ready.push(Reverse(k));
                }
            }
        }
        if sorted.len() != order.len() {
            return Err(FuseError::invalid_graph("cycle detected while ordering block"));
        }
        self.blocks[block.0].nodes = sorted;
        Ok(())
    }

    /// Walks up from `node` to its ancestor that lives in `block`.
    fn ancestor_in_block(&self, mut node: NodeId, block: BlockId) -> Option<NodeId> {
        loop {
            let owner = self.nodes[node.0].owner;
            if owner == block {
                return Some(node);
            }
            node = self.blocks[owner.0].owner?;
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Checks definition-before-use, use-list consistency and block ownership.
    pub fn validate(&self) -> FuseResult<()> {
        let mut visible: FxHashSet<ValueId> = self.inputs.iter().copied().collect();
        self.validate_block(BlockId(0), &mut visible)?;

        for node in self.nodes.iter().filter(|n| n.alive) {
            for (index, &input) in node.inputs.iter().enumerate() {
                let u = Use { node: node.id, index };
                if !self.values[input.0].uses.contains(&u) {
                    return Err(FuseError::invalid_graph(format!(
                        "use list of {input} is missing input {index} of node {}",
                        node.id.0
                    )));
                }
            }
        }
        for value in &self.values {
            for u in &value.uses {
                let node = &self.nodes[u.node.0];
                if !node.alive || node.inputs.get(u.index) != Some(&value.id) {
                    return Err(FuseError::invalid_graph(format!(
                        "stale use of {} by node {}",
                        value.id, u.node.0
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_block(&self, block: BlockId, visible: &mut FxHashSet<ValueId>) -> FuseResult<()> {
        for &n in &self.blocks[block.0].nodes {
            let node = &self.nodes[n.0];
            if !node.alive || node.owner != block {
                return Err(FuseError::invalid_graph(format!(
                    "node {} is not a live member of its block",
                    n.0
                )));
            }
            for &input in &node.inputs {
                if !visible.contains(&input) {
                    return Err(FuseError::invalid_graph(format!(
                        "{} node {} uses {input} before its definition",
                        node.op.name(),
                        n.0
                    )));
                }
            }
            for &b in &node.blocks {
                let mut inner = visible.clone();
                self.validate_block(b, &mut inner)?;
            }
            visible.extend(node.outputs.iter().copied());
        }
        for r in &self.blocks[block.0].returns {
            if !visible.contains(r) {
                return Err(FuseError::invalid_graph(format!(
                    "block returns undefined value {r}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(ToString::to_string).collect();
        writeln!(f, "graph({}):", inputs.join(", "))?;
        self.fmt_block(f, BlockId(0), 1)?;
        Ok(())
    }
}

impl Graph {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: BlockId, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        for &n in &self.blocks[block.0].nodes {
            let node = &self.nodes[n.0];
            let outs: Vec<String> = node.outputs.iter().map(ToString::to_string).collect();
            let ins: Vec<String> = node.inputs.iter().map(ToString::to_string).collect();
            writeln!(f, "{pad}{} = {}({})", outs.join(", "), node.op.name(), ins.join(", "))?;
            for &b in &node.blocks {
                self.fmt_block(f, b, depth + 1)?;
            }
        }
        let rets: Vec<String> = self.blocks[block.0].returns.iter().map(ToString::to_string).collect();
        writeln!(f, "{pad}return ({})", rets.join(", "))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn relu() -> Op {
        Op::Unary {
            op: UnaryOp::Relu,
            inplace: false,
        }
    }

    #[test]
    fn test_graph_creation() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", ValueType::tensor(DType::F32, &[2, 3]));
        let top = graph.top_block();
        let n = graph.append_node(top, relu(), &[x], 1);
        let y = graph.node(n).outputs()[0];
        graph.set_outputs(vec![y]);

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.value(x).uses(), &[Use { node: n, index: 0 }]);
        assert!(graph.is_graph_output(y));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_replace_and_remove() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", ValueType::tensor(DType::F32, &[4]));
        let top = graph.top_block();
        let a = graph.append_node(top, relu(), &[x], 1);
        let a_out = graph.node(a).outputs()[0];
        let b = graph.append_node(top, relu(), &[a_out], 1);
        let b_out = graph.node(b).outputs()[0];
        graph.set_outputs(vec![b_out]);

        assert!(graph.remove_node(a).is_err());
        graph.replace_all_uses(a_out, x);
        graph.remove_node(a).unwrap();
        assert_eq!(graph.node(b).inputs(), &[x]);
        assert_eq!(graph.nodes(), &[b]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_wide_node_operands() {
        let mut graph = Graph::new();
        let xs: Vec<ValueId> = (0..6)
            .map(|i| graph.add_input(&format!("x{i}"), ValueType::tensor(DType::F32, &[2])))
            .collect();
        let top = graph.top_block();
        let n = graph.append_node(top, Op::Cat { dim: 0 }, &xs, 1);
        let extra = graph.add_output(n);
        assert_eq!(graph.node(n).inputs(), xs.as_slice());
        assert_eq!(graph.node(n).outputs().len(), 2);
        assert_eq!(graph.producer_node(extra), Some(n));

        graph.set_input(n, 5, xs[0]);
        assert_eq!(graph.node(n).inputs()[5], xs[0]);
        assert_eq!(graph.value(xs[0]).uses().len(), 2);
        assert!(graph.value(xs[5]).uses().is_empty());

        let out = graph.node(n).outputs()[0];
        graph.set_outputs(vec![out]);
        graph.remove_node(n).unwrap_err();
        graph.set_outputs(Vec::new());
        graph.remove_node(n).unwrap();
        assert!(xs.iter().all(|&x| graph.value(x).uses().is_empty()));
    }

    #[test]
    fn test_insert_before_keeps_order() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", ValueType::tensor(DType::F32, &[4]));
        let top = graph.top_block();
        let a = graph.append_node(top, relu(), &[x], 1);
        let b = graph.insert_before(a, relu(), &[x], 1);
        let c = graph.insert_after(a, relu(), &[x], 1);
        assert_eq!(graph.nodes(), &[b, a, c]);
    }

    #[test]
    fn test_validate_rejects_use_before_def() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", ValueType::tensor(DType::F32, &[4]));
        let top = graph.top_block();
        let a = graph.append_node(top, relu(), &[x], 1);
        let a_out = graph.node(a).outputs()[0];
        let b = graph.insert_before(a, relu(), &[a_out], 1);
        let b_out = graph.node(b).outputs()[0];
        graph.set_outputs(vec![b_out]);
        assert!(graph.validate().is_err());

        graph.sort_block(top).unwrap();
        assert_eq!(graph.nodes(), &[a, b]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_nested_block_ancestor() {
        let mut graph = Graph::new();
        let c = graph.add_input("c", ValueType::Bool);
        let x = graph.add_input("x", ValueType::tensor(DType::F32, &[4]));
        let top = graph.top_block();
        let if_node = graph.append_node(top, Op::If, &[c], 1);
        let then_block = graph.add_block(if_node);
        let else_block = graph.add_block(if_node);
        let inner = graph.append_node(then_block, relu(), &[x], 1);
        let inner_out = graph.node(inner).outputs()[0];
        graph.set_block_returns(then_block, vec![inner_out]);
        graph.set_block_returns(else_block, vec![x]);
        let out = graph.node(if_node).outputs()[0];
        graph.set_outputs(vec![out]);

        assert!(!graph.is_top_level(inner));
        assert_eq!(graph.top_level_ancestor(inner), if_node);
        assert_eq!(graph.top_level_users(x), vec![if_node]);
        assert_eq!(graph.all_nodes(), vec![if_node, inner]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_op_kind_and_inplace() {
        let op = Op::Binary {
            op: BinaryOp::Mul,
            inplace: true,
        };
        assert_eq!(op.kind(), OpKind::Mul);
        assert!(op.is_inplace());
        assert!(op.may_alias_input());
        assert!(!op.out_of_place().is_inplace());
        assert!(OpKind::Dequantize.is_quant_marker());
        assert_eq!(OpKind::QuantizePerChannel.name(), "quantize_per_channel");
    }
}

//! Operation Tracing
//!
//! Records a `Graph` by running a closure over traced values. Every method
//! on `TracedValue` appends one node to the block currently being recorded,
//! so `if_then_else` can record each branch into its own nested block.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::RefCell;

use onegraph_tensor::kernels::{BinaryOp, Conv2dParams, PoolParams, UnaryOp};
use onegraph_tensor::{DType, Layout, Tensor};

use crate::error::{FuseError, FuseResult};
use crate::ir::{BlockId, ConstValue, Graph, Op, TensorType, ValueId, ValueType};

// =============================================================================
// Tracer State
// =============================================================================

thread_local! {
    static TRACER: RefCell<TracerState> = RefCell::new(TracerState::new());
}

struct TracerState {
    graph: Graph,
    blocks: Vec<BlockId>,
    tracer_id: usize,
}

impl TracerState {
    fn new() -> Self {
        Self {
            graph: Graph::new(),
            blocks: Vec::new(),
            tracer_id: 0,
        }
    }

    fn current_block(&self) -> BlockId {
        self.blocks.last().copied().unwrap_or_else(|| self.graph.top_block())
    }

    fn record(&mut self, op: Op, inputs: &[ValueId]) -> TracedValue {
        let block = self.current_block();
        let node = self.graph.append_node(block, op, inputs, 1);
        TracedValue::new(self.graph.node(node).outputs()[0], self.tracer_id)
    }
}

fn record(op: Op, inputs: &[ValueId]) -> TracedValue {
    TRACER.with(|t| t.borrow_mut().record(op, inputs))
}

fn record_scalar(value: f64) -> ValueId {
    record(Op::Constant(ConstValue::Float(value)), &[]).id
}

// =============================================================================
// Traced Values
// =============================================================================

/// A value recorded in the graph being traced.
#[derive(Debug, Clone, Copy)]
pub struct TracedValue {
    pub(crate) id: ValueId,
    #[allow(dead_code)]
    tracer_id: usize,
}

impl TracedValue {
    fn new(id: ValueId, tracer_id: usize) -> Self {
        Self { id, tracer_id }
    }

    /// Returns the graph value id.
    pub fn value_id(&self) -> ValueId {
        self.id
    }

    // Compute operations

    /// 2-d convolution with weight `[out, in / groups, kh, kw]`.
    pub fn conv2d(&self, weight: &TracedValue, bias: Option<&TracedValue>, params: Conv2dParams) -> TracedValue {
        let mut inputs = vec![self.id, weight.id];
        inputs.extend(bias.map(|b| b.id));
        record(Op::Conv2d(params), &inputs)
    }

    /// Linear layer with weight `[out, in]`.
    pub fn linear(&self, weight: &TracedValue, bias: Option<&TracedValue>) -> TracedValue {
        let mut inputs = vec![self.id, weight.id];
        inputs.extend(bias.map(|b| b.id));
        record(Op::Linear, &inputs)
    }

    /// Matrix multiplication.
    pub fn matmul(&self, other: &TracedValue) -> TracedValue {
        record(Op::MatMul, &[self.id, other.id])
    }

    /// Batched matrix multiplication.
    pub fn bmm(&self, other: &TracedValue) -> TracedValue {
        record(Op::Bmm, &[self.id, other.id])
    }

    /// Inference batch norm.
    pub fn batch_norm(
        &self,
        mean: &TracedValue,
        var: &TracedValue,
        weight: &TracedValue,
        bias: &TracedValue,
        eps: f32,
    ) -> TracedValue {
        record(
            Op::BatchNorm { eps },
            &[self.id, mean.id, var.id, weight.id, bias.id],
        )
    }

    /// Layer norm over a static trailing shape.
    pub fn layer_norm(
        &self,
        normalized_shape: &[usize],
        affine: Option<(&TracedValue, &TracedValue)>,
        eps: f32,
    ) -> TracedValue {
        let mut inputs = vec![self.id];
        if let Some((w, b)) = affine {
            inputs.extend([w.id, b.id]);
        }
        record(
            Op::LayerNorm {
                normalized_shape: Some(normalized_shape.to_vec()),
                eps,
            },
            &inputs,
        )
    }

    /// Layer norm whose normalized shape is computed at runtime.
    pub fn layer_norm_dynamic(
        &self,
        normalized_shape: &TracedValue,
        affine: Option<(&TracedValue, &TracedValue)>,
        eps: f32,
    ) -> TracedValue {
        let mut inputs = vec![self.id, normalized_shape.id];
        if let Some((w, b)) = affine {
            inputs.extend([w.id, b.id]);
        }
        record(
            Op::LayerNorm {
                normalized_shape: None,
                eps,
            },
            &inputs,
        )
    }

    /// Softmax along a dimension.
    pub fn softmax(&self, dim: i64) -> TracedValue {
        record(Op::Softmax { dim }, &[self.id])
    }

    /// Mean over dimensions.
    pub fn mean(&self, dims: &[i64], keepdim: bool) -> TracedValue {
        record(
            Op::Mean {
                dims: dims.to_vec(),
                keepdim,
            },
            &[self.id],
        )
    }

    /// 2-d max pooling.
    pub fn max_pool2d(&self, params: PoolParams) -> TracedValue {
        record(Op::MaxPool2d(params), &[self.id])
    }

    /// 2-d average pooling.
    pub fn avg_pool2d(&self, params: PoolParams, count_include_pad: bool) -> TracedValue {
        record(
            Op::AvgPool2d {
                params,
                count_include_pad,
            },
            &[self.id],
        )
    }

    /// Adaptive average pooling to a fixed output size.
    pub fn adaptive_avg_pool2d(&self, output_size: [usize; 2]) -> TracedValue {
        record(Op::AdaptiveAvgPool2d { output_size }, &[self.id])
    }

    // Elementwise operations

    /// Applies a unary operator.
    pub fn unary(&self, op: UnaryOp) -> TracedValue {
        record(Op::Unary { op, inplace: false }, &[self.id])
    }

    /// Applies a unary operator in place.
    pub fn unary_(&self, op: UnaryOp) -> TracedValue {
        record(Op::Unary { op, inplace: true }, &[self.id])
    }

    /// ReLU activation.
    pub fn relu(&self) -> TracedValue {
        self.unary(UnaryOp::Relu)
    }

    /// Inplace ReLU activation.
    pub fn relu_(&self) -> TracedValue {
        self.unary_(UnaryOp::Relu)
    }

    /// Sigmoid activation.
    pub fn sigmoid(&self) -> TracedValue {
        self.unary(UnaryOp::Sigmoid)
    }

    /// Tanh activation.
    pub fn tanh(&self) -> TracedValue {
        self.unary(UnaryOp::Tanh)
    }

    /// GELU activation.
    pub fn gelu(&self) -> TracedValue {
        self.unary(UnaryOp::Gelu)
    }

    /// Clamp to optional bounds.
    pub fn clamp(&self, min: Option<f32>, max: Option<f32>) -> TracedValue {
        record(
            Op::Clamp {
                min,
                max,
                inplace: false,
            },
            &[self.id],
        )
    }

    /// Inplace clamp.
    pub fn clamp_(&self, min: Option<f32>, max: Option<f32>) -> TracedValue {
        record(
            Op::Clamp {
                min,
                max,
                inplace: true,
            },
            &[self.id],
        )
    }

    /// Applies a binary operator to two traced values.
    pub fn binary(&self, other: &TracedValue, op: BinaryOp) -> TracedValue {
        record(Op::Binary { op, inplace: false }, &[self.id, other.id])
    }

    /// Applies a binary operator with a scalar right operand.
    pub fn binary_scalar(&self, scalar: f64, op: BinaryOp) -> TracedValue {
        let rhs = record_scalar(scalar);
        record(Op::Binary { op, inplace: false }, &[self.id, rhs])
    }

    /// Element-wise addition.
    pub fn add(&self, other: &TracedValue) -> TracedValue {
        self.binary(other, BinaryOp::Add)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &TracedValue) -> TracedValue {
        self.binary(other, BinaryOp::Sub)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, other: &TracedValue) -> TracedValue {
        self.binary(other, BinaryOp::Mul)
    }

    /// Element-wise division.
    pub fn div(&self, other: &TracedValue) -> TracedValue {
        self.binary(other, BinaryOp::Div)
    }

    /// Element-wise maximum.
    pub fn maximum(&self, other: &TracedValue) -> TracedValue {
        self.binary(other, BinaryOp::Maximum)
    }

    /// Element-wise greater-than.
    pub fn gt(&self, other: &TracedValue) -> TracedValue {
        self.binary(other, BinaryOp::Gt)
    }

    /// Adds a scalar.
    pub fn add_scalar(&self, scalar: f64) -> TracedValue {
        self.binary_scalar(scalar, BinaryOp::Add)
    }

    /// Multiplies by a scalar.
    pub fn mul_scalar(&self, scalar: f64) -> TracedValue {
        self.binary_scalar(scalar, BinaryOp::Mul)
    }

    /// Divides by a scalar.
    pub fn div_scalar(&self, scalar: f64) -> TracedValue {
        self.binary_scalar(scalar, BinaryOp::Div)
    }

    /// Inplace multiplication.
    pub fn mul_(&self, other: &TracedValue) -> TracedValue {
        record(
            Op::Binary {
                op: BinaryOp::Mul,
                inplace: true,
            },
            &[self.id, other.id],
        )
    }

    /// Inplace addition.
    pub fn add_(&self, other: &TracedValue) -> TracedValue {
        record(
            Op::Binary {
                op: BinaryOp::Add,
                inplace: true,
            },
            &[self.id, other.id],
        )
    }

    /// Inplace scalar addition.
    pub fn add_scalar_(&self, scalar: f64) -> TracedValue {
        let rhs = record_scalar(scalar);
        record(
            Op::Binary {
                op: BinaryOp::Add,
                inplace: true,
            },
            &[self.id, rhs],
        )
    }

    // Shape operations

    /// Aliasing reshape.
    pub fn view(&self, shape: &[i64]) -> TracedValue {
        record(
            Op::View {
                shape: Some(shape.to_vec()),
            },
            &[self.id],
        )
    }

    /// Aliasing reshape to a shape computed at runtime.
    pub fn view_dynamic(&self, shape: &TracedValue) -> TracedValue {
        record(Op::View { shape: None }, &[self.id, shape.id])
    }

    /// Reshape, copying when needed.
    pub fn reshape(&self, shape: &[i64]) -> TracedValue {
        record(
            Op::Reshape {
                shape: Some(shape.to_vec()),
            },
            &[self.id],
        )
    }

    /// Reorders dimensions.
    pub fn permute(&self, dims: &[usize]) -> TracedValue {
        record(Op::Permute { dims: dims.to_vec() }, &[self.id])
    }

    /// Swaps two dimensions.
    pub fn transpose(&self, dim0: i64, dim1: i64) -> TracedValue {
        record(Op::Transpose { dim0, dim1 }, &[self.id])
    }

    /// Dense copy in the given layout.
    pub fn contiguous(&self, layout: Layout) -> TracedValue {
        record(Op::Contiguous { layout }, &[self.id])
    }

    /// Selects one index along a dimension.
    pub fn select(&self, dim: i64, index: i64) -> TracedValue {
        record(Op::Select { dim, index }, &[self.id])
    }

    /// Size of one dimension.
    pub fn size(&self, dim: i64) -> TracedValue {
        record(Op::Size { dim: Some(dim) }, &[self.id])
    }

    /// All dimension sizes as a list.
    pub fn sizes(&self) -> TracedValue {
        record(Op::Size { dim: None }, &[self.id])
    }

    // Casts and quantization

    /// Precision cast.
    pub fn to(&self, dtype: DType) -> TracedValue {
        record(Op::To { dtype }, &[self.id])
    }

    /// Per-tensor quantization.
    pub fn quantize_per_tensor(&self, scale: f32, zero_point: i32, dtype: DType) -> TracedValue {
        record(
            Op::QuantizePerTensor {
                scale,
                zero_point,
                dtype,
            },
            &[self.id],
        )
    }

    /// Per-channel quantization.
    pub fn quantize_per_channel(&self, scales: Vec<f32>, zero_points: Vec<i32>, axis: usize, dtype: DType) -> TracedValue {
        record(
            Op::QuantizePerChannel {
                scales,
                zero_points,
                axis,
                dtype,
            },
            &[self.id],
        )
    }

    /// Dequantization back to f32.
    pub fn dequantize(&self) -> TracedValue {
        record(Op::Dequantize, &[self.id])
    }
}

// =============================================================================
// Tracer Handle
// =============================================================================

/// Handle for creating inputs, constants and control flow while tracing.
pub struct Tracer {
    tracer_id: usize,
}

impl Tracer {
    /// Creates a tensor input with a known shape.
    pub fn input(&self, name: &str, dtype: DType, shape: &[usize]) -> TracedValue {
        self.input_typed(name, ValueType::tensor(dtype, shape))
    }

    /// Creates a tensor input whose shape is unknown until profiling.
    pub fn input_unshaped(&self, name: &str, dtype: DType) -> TracedValue {
        self.input_typed(name, ValueType::Tensor(TensorType::unknown_shape(dtype)))
    }

    /// Creates an input of any type.
    pub fn input_typed(&self, name: &str, ty: ValueType) -> TracedValue {
        TRACER.with(|t| {
            let mut tracer = t.borrow_mut();
            let id = tracer.graph.add_input(name, ty);
            TracedValue::new(id, self.tracer_id)
        })
    }

    /// Records a constant tensor such as a weight.
    pub fn constant(&self, tensor: Tensor) -> TracedValue {
        record(Op::Constant(ConstValue::Tensor(tensor)), &[])
    }

    /// Records a float scalar constant.
    pub fn scalar(&self, value: f64) -> TracedValue {
        record(Op::Constant(ConstValue::Float(value)), &[])
    }

    /// Records an integer constant.
    pub fn int(&self, value: i64) -> TracedValue {
        record(Op::Constant(ConstValue::Int(value)), &[])
    }

    /// Packs values into a list.
    pub fn list(&self, items: &[TracedValue]) -> TracedValue {
        let ids: Vec<ValueId> = items.iter().map(|v| v.id).collect();
        record(Op::ListConstruct, &ids)
    }

    /// Concatenates tensors along a dimension.
    pub fn cat(&self, items: &[TracedValue], dim: i64) -> TracedValue {
        let ids: Vec<ValueId> = items.iter().map(|v| v.id).collect();
        record(Op::Cat { dim }, &ids)
    }

    /// Records a two-way branch; both branches must return the same number
    /// of values.
    pub fn if_then_else<T, E>(&self, cond: &TracedValue, then_branch: T, else_branch: E) -> FuseResult<Vec<TracedValue>>
    where
        T: FnOnce(&Tracer) -> Vec<TracedValue>,
        E: FnOnce(&Tracer) -> Vec<TracedValue>,
    {
        let (node, then_block, else_block) = TRACER.with(|t| {
            let mut tracer = t.borrow_mut();
            let block = tracer.current_block();
            let node = tracer.graph.append_node(block, Op::If, &[cond.id], 0);
            let then_block = tracer.graph.add_block(node);
            let else_block = tracer.graph.add_block(node);
            (node, then_block, else_block)
        });

        let then_values = self.record_block(then_block, then_branch);
        let else_values = self.record_block(else_block, else_branch);
        if then_values.len() != else_values.len() {
            return Err(FuseError::invalid_graph(format!(
                "if branches return {} and {} values",
                then_values.len(),
                else_values.len()
            )));
        }

        TRACER.with(|t| {
            let mut tracer = t.borrow_mut();
            let ids = |values: &[TracedValue]| values.iter().map(|v| v.id).collect::<Vec<_>>();
            tracer.graph.set_block_returns(then_block, ids(&then_values));
            tracer.graph.set_block_returns(else_block, ids(&else_values));
            let outputs = (0..then_values.len())
                .map(|_| TracedValue::new(tracer.graph.add_output(node), self.tracer_id))
                .collect();
            Ok(outputs)
        })
    }

    fn record_block<F>(&self, block: BlockId, f: F) -> Vec<TracedValue>
    where
        F: FnOnce(&Tracer) -> Vec<TracedValue>,
    {
        TRACER.with(|t| t.borrow_mut().blocks.push(block));
        let values = f(self);
        TRACER.with(|t| t.borrow_mut().blocks.pop());
        values
    }
}

/// Traces a closure into a graph whose outputs are the returned values.
///
/// # Example
///
/// ```
/// use onegraph_fuser::trace;
/// use onegraph_tensor::DType;
///
/// let graph = trace(|tracer| {
///     let a = tracer.input("a", DType::F32, &[2, 3]);
///     let b = tracer.input("b", DType::F32, &[2, 3]);
///     vec![a.add(&b).relu()]
/// });
///
/// assert_eq!(graph.inputs().len(), 2);
/// assert_eq!(graph.outputs().len(), 1);
/// ```
pub fn trace<F>(f: F) -> Graph
where
    F: FnOnce(&Tracer) -> Vec<TracedValue>,
{
    TRACER.with(|t| {
        let mut tracer = t.borrow_mut();
        tracer.graph = Graph::new();
        tracer.blocks.clear();
        tracer.tracer_id += 1;
        let tracer_id = tracer.tracer_id;
        drop(tracer);

        let handle = Tracer { tracer_id };
        let outputs = f(&handle);

        let mut tracer = t.borrow_mut();
        tracer.blocks.clear();
        let mut graph = std::mem::take(&mut tracer.graph);
        graph.set_outputs(outputs.iter().map(|v| v.id).collect());
        graph
    })
}

// =============================================================================
// Tests
// =============================================================================

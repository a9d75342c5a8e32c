//! Graph Interpreter
//!
//! Executes a graph node by node with the reference kernels. Fusion group
//! nodes run through their partition executor; `if` nodes run the branch
//! selected by their condition. Inplace nodes compute their result and
//! write it through the storage of their first input, so every alias of
//! that input observes the mutation.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::kernels::{self, BinaryOp};
use onegraph_tensor::shape::normalize_dim;
use onegraph_tensor::Tensor;

use crate::error::{FuseError, FuseResult};
use crate::ir::{BlockId, Graph, NodeId, Op, ValueId};
use crate::value::RtValue;

/// Callback invoked with every value the interpreter produces.
pub type Observer<'a> = dyn FnMut(ValueId, &RtValue) + 'a;

/// Executes graphs with the reference kernels.
pub struct Interpreter<'a> {
    graph: &'a Graph,
    observer: Option<&'a mut Observer<'a>>,
}

impl<'a> Interpreter<'a> {
    /// Creates an interpreter for a graph.
    pub fn new(graph: &'a Graph) -> Self {
        Self {
            graph,
            observer: None,
        }
    }

    /// Reports every graph input and node output to `observer`.
    pub fn with_observer(mut self, observer: &'a mut Observer<'a>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs the graph and returns its outputs.
    pub fn run(&mut self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        let graph = self.graph;
        if inputs.len() != graph.inputs().len() {
            return Err(FuseError::InputCount {
                expected: graph.inputs().len(),
                found: inputs.len(),
            });
        }
        let mut env: Vec<Option<RtValue>> = vec![None; graph.num_values()];
        for (&id, value) in graph.inputs().iter().zip(inputs) {
            self.observe(id, value);
            env[id.index()] = Some(value.clone());
        }
        self.exec_block(graph.top_block(), &mut env)?;
        graph.outputs().iter().map(|&v| lookup(&env, v).cloned()).collect()
    }

    fn observe(&mut self, id: ValueId, value: &RtValue) {
        if let Some(observer) = self.observer.as_mut() {
            observer(id, value);
        }
    }

    fn exec_block(&mut self, block: BlockId, env: &mut [Option<RtValue>]) -> FuseResult<()> {
        for &node in self.graph.block_nodes(block) {
            self.exec_node(node, env)?;
        }
        Ok(())
    }

    fn exec_node(&mut self, id: NodeId, env: &mut [Option<RtValue>]) -> FuseResult<()> {
        let graph = self.graph;
        let node = graph.node(id);
        let inputs: Vec<RtValue> = node
            .inputs()
            .iter()
            .map(|&v| lookup(env, v).cloned())
            .collect::<FuseResult<_>>()?;

        let outputs = match &node.op {
            Op::If => {
                let taken = if inputs[0].as_bool()? { 0 } else { 1 };
                let block = *node
                    .blocks()
                    .get(taken)
                    .ok_or_else(|| FuseError::invalid_graph("if node without both branches"))?;
                self.exec_block(block, env)?;
                graph
                    .block_returns(block)
                    .iter()
                    .map(|&v| lookup(env, v).cloned())
                    .collect::<FuseResult<Vec<_>>>()?
            }
            Op::FusionGroup(group) => group.run(&inputs)?,
            op => eval_op(op, &inputs)?,
        };

        if outputs.len() != node.outputs().len() {
            return Err(FuseError::runtime(format!(
                "{} produced {} values for {} outputs",
                node.op.name(),
                outputs.len(),
                node.outputs().len()
            )));
        }
        for (&id, value) in node.outputs().iter().zip(outputs) {
            self.observe(id, &value);
            env[id.index()] = Some(value);
        }
        Ok(())
    }
}

/// Runs a graph with the reference kernels.
pub fn run_graph(graph: &Graph, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
    Interpreter::new(graph).run(inputs)
}

fn lookup(env: &[Option<RtValue>], id: ValueId) -> FuseResult<&RtValue> {
    env.get(id.index())
        .and_then(Option::as_ref)
        .ok_or_else(|| FuseError::runtime(format!("value {id} read before it was computed")))
}

// =============================================================================
// Operator Evaluation
// =============================================================================

fn tensor_arg(inputs: &[RtValue], i: usize) -> FuseResult<&Tensor> {
    inputs
        .get(i)
        .ok_or_else(|| FuseError::runtime(format!("missing input {i}")))?
        .as_tensor()
}

fn optional_tensor(inputs: &[RtValue], i: usize) -> Option<&Tensor> {
    inputs.get(i).and_then(RtValue::tensor)
}

fn static_or_runtime_shape(shape: &Option<Vec<i64>>, inputs: &[RtValue]) -> FuseResult<Vec<i64>> {
    match shape {
        Some(shape) => Ok(shape.clone()),
        None => inputs
            .get(1)
            .ok_or_else(|| FuseError::runtime("missing runtime shape"))?
            .as_ints(),
    }
}

/// Writes `result` through the storage of `base` and returns the base alias.
fn write_inplace(base: &Tensor, result: &Tensor) -> FuseResult<RtValue> {
    if result.shape() != base.shape() {
        return Err(FuseError::runtime(format!(
            "inplace result of shape {:?} does not fit base of shape {:?}",
            result.shape(),
            base.shape()
        )));
    }
    base.assign(&result.to_vec())?;
    Ok(RtValue::Tensor(base.clone()))
}

/// Evaluates one operator on runtime values with the reference kernels.
pub(crate) fn eval_op(op: &Op, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
    let tensor = |t: Tensor| -> FuseResult<Vec<RtValue>> { Ok(vec![RtValue::Tensor(t)]) };
    match op {
        Op::Constant(value) => Ok(vec![RtValue::from(value)]),
        Op::Conv2d(params) => tensor(kernels::conv2d(
            tensor_arg(inputs, 0)?,
            tensor_arg(inputs, 1)?,
            optional_tensor(inputs, 2),
            params,
        )?),
        Op::Linear => tensor(kernels::linear(
            tensor_arg(inputs, 0)?,
            tensor_arg(inputs, 1)?,
            optional_tensor(inputs, 2),
        )?),
        Op::MatMul => tensor(kernels::matmul(tensor_arg(inputs, 0)?, tensor_arg(inputs, 1)?)?),
        Op::Bmm => tensor(kernels::bmm(tensor_arg(inputs, 0)?, tensor_arg(inputs, 1)?)?),
        Op::BatchNorm { eps } => tensor(kernels::batch_norm(
            tensor_arg(inputs, 0)?,
            tensor_arg(inputs, 1)?,
            tensor_arg(inputs, 2)?,
            optional_tensor(inputs, 3),
            optional_tensor(inputs, 4),
            *eps,
        )?),
        Op::LayerNorm { normalized_shape, eps } => {
            let (shape, affine_at) = match normalized_shape {
                Some(shape) => (shape.clone(), 1),
                None => {
                    let dims = static_or_runtime_shape(&None, inputs)?;
                    let dims = dims
                        .into_iter()
                        .map(|d| usize::try_from(d).map_err(|_| FuseError::runtime(format!("negative layer_norm dim {d}"))))
                        .collect::<FuseResult<Vec<_>>>()?;
                    (dims, 2)
                }
            };
            tensor(kernels::layer_norm(
                tensor_arg(inputs, 0)?,
                &shape,
                optional_tensor(inputs, affine_at),
                optional_tensor(inputs, affine_at + 1),
                *eps,
            )?)
        }
        Op::Softmax { dim } => tensor(kernels::softmax(tensor_arg(inputs, 0)?, *dim)?),
        Op::Mean { dims, keepdim } => tensor(kernels::mean(tensor_arg(inputs, 0)?, dims, *keepdim)?),
        Op::Cat { dim } => {
            let parts = inputs
                .iter()
                .map(|v| v.as_tensor().cloned())
                .collect::<FuseResult<Vec<_>>>()?;
            tensor(kernels::cat(&parts, *dim)?)
        }
        Op::MaxPool2d(params) => tensor(kernels::max_pool2d(tensor_arg(inputs, 0)?, params)?),
        Op::AvgPool2d {
            params,
            count_include_pad,
        } => tensor(kernels::avg_pool2d(tensor_arg(inputs, 0)?, params, *count_include_pad)?),
        Op::AdaptiveAvgPool2d { output_size } => {
            tensor(kernels::adaptive_avg_pool2d(tensor_arg(inputs, 0)?, *output_size)?)
        }
        Op::Unary { op, inplace } => {
            let x = tensor_arg(inputs, 0)?;
            let y = kernels::unary(x, *op)?;
            if *inplace {
                Ok(vec![write_inplace(x, &y)?])
            } else {
                tensor(y)
            }
        }
        Op::Clamp { min, max, inplace } => {
            let x = tensor_arg(inputs, 0)?;
            let y = kernels::clamp(x, *min, *max)?;
            if *inplace {
                Ok(vec![write_inplace(x, &y)?])
            } else {
                tensor(y)
            }
        }
        Op::Binary { op, inplace } => {
            let (lhs, rhs) = match inputs {
                [lhs, rhs] => (lhs, rhs),
                _ => return Err(FuseError::runtime("binary op expects two operands")),
            };
            let result = match (lhs, rhs) {
                (RtValue::Tensor(a), RtValue::Tensor(b)) => kernels::binary(a, b, *op)?,
                (RtValue::Tensor(a), s) => kernels::binary_scalar(a, s.as_scalar()? as f32, *op, false)?,
                (s, RtValue::Tensor(b)) => kernels::binary_scalar(b, s.as_scalar()? as f32, *op, true)?,
                (a, b) => {
                    let value = op.apply(a.as_scalar()? as f32, b.as_scalar()? as f32);
                    return Ok(vec![if *op == BinaryOp::Gt {
                        RtValue::Bool(value != 0.0)
                    } else {
                        RtValue::Float(f64::from(value))
                    }]);
                }
            };
            match (inplace, lhs) {
                (true, RtValue::Tensor(base)) => Ok(vec![write_inplace(base, &result)?]),
                (true, _) => Err(FuseError::runtime("inplace binary op on a scalar")),
                (false, _) => tensor(result),
            }
        }
        Op::View { shape } => {
            let target = static_or_runtime_shape(shape, inputs)?;
            tensor(tensor_arg(inputs, 0)?.view(&target)?)
        }
        Op::Reshape { shape } => {
            let target = static_or_runtime_shape(shape, inputs)?;
            tensor(tensor_arg(inputs, 0)?.reshape(&target)?)
        }
        Op::Permute { dims } => tensor(tensor_arg(inputs, 0)?.permute(dims)?),
        Op::Transpose { dim0, dim1 } => tensor(tensor_arg(inputs, 0)?.transpose(*dim0, *dim1)?),
        Op::Contiguous { layout } => tensor(tensor_arg(inputs, 0)?.contiguous(*layout)),
        Op::Select { dim, index } => tensor(tensor_arg(inputs, 0)?.select(*dim, *index)?),
        Op::Size { dim } => {
            let x = tensor_arg(inputs, 0)?;
            let value = match dim {
                Some(d) => RtValue::Int(x.shape()[normalize_dim(*d, x.ndim())?] as i64),
                None => RtValue::Ints(x.shape().iter().map(|&s| s as i64).collect()),
            };
            Ok(vec![value])
        }
        Op::ListConstruct => {
            let ints: Option<Vec<i64>> = inputs
                .iter()
                .map(|v| match v {
                    RtValue::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Ok(vec![match ints {
                Some(ints) => RtValue::Ints(ints),
                None => RtValue::List(inputs.to_vec()),
            }])
        }
        Op::To { dtype } => tensor(tensor_arg(inputs, 0)?.to_dtype(*dtype)?),
        Op::QuantizePerTensor {
            scale,
            zero_point,
            dtype,
        } => tensor(kernels::quantize_per_tensor(tensor_arg(inputs, 0)?, *scale, *zero_point, *dtype)?),
        Op::QuantizePerChannel {
            scales,
            zero_points,
            axis,
            dtype,
        } => tensor(kernels::quantize_per_channel(
            tensor_arg(inputs, 0)?,
            scales,
            zero_points,
            *axis,
            *dtype,
        )?),
        Op::Dequantize => tensor(kernels::dequantize(tensor_arg(inputs, 0)?)?),
        Op::If | Op::FusionGroup(_) => Err(FuseError::runtime(format!(
            "{} cannot be evaluated as a single operator",
            op.name()
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

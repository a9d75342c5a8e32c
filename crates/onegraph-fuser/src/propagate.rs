//! Type and Shape Propagation
//!
//! Forward simulation of every node's typing rule. Each value receives a
//! dtype, a concrete shape or "unknown", and a layout tag. Rules that depend
//! on runtime data (a layer norm or view whose target shape is computed by
//! `size` nodes) yield an unknown shape; unknown input shapes propagate to
//! the outputs. Running the pass twice gives the same result.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::kernels::matmul::matmul_shape;
use onegraph_tensor::kernels::reduce::reduced_shape;
use onegraph_tensor::shape::{normalize_dim, permute_shape, reshape};
use onegraph_tensor::{DType, Layout, Shape, TensorError};

use crate::error::{FuseError, FuseResult};
use crate::group::FusionGroup;
use crate::ir::{BlockId, Graph, NodeId, Op, TensorType, ValueType};
use crate::value::RtValue;

// =============================================================================
// Entry Points
// =============================================================================

/// Infers the type of every value from the declared input types.
pub fn propagate(graph: &mut Graph) -> FuseResult<()> {
    let top = graph.top_block();
    propagate_block(graph, top)
}

/// Seeds the graph input types from example inputs, then propagates.
pub fn propagate_with_inputs(graph: &mut Graph, inputs: &[RtValue]) -> FuseResult<()> {
    if inputs.len() != graph.inputs().len() {
        return Err(FuseError::InputCount {
            expected: graph.inputs().len(),
            found: inputs.len(),
        });
    }
    for (id, value) in graph.inputs().to_vec().into_iter().zip(inputs) {
        graph.set_type(id, value.value_type());
    }
    propagate(graph)
}

/// Propagates the types a fusion group receives through its body and
/// returns the resulting output types.
pub(crate) fn infer_group(group: &FusionGroup, inputs: &[ValueType]) -> FuseResult<Vec<ValueType>> {
    let mut body = group.subgraph.clone();
    for (&id, ty) in group.subgraph.inputs().iter().zip(inputs) {
        body.set_type(id, ty.clone());
    }
    propagate(&mut body)?;
    Ok(body.outputs().iter().map(|&v| body.value_type(v).clone()).collect())
}

fn propagate_block(graph: &mut Graph, block: BlockId) -> FuseResult<()> {
    for node in graph.block_nodes(block).to_vec() {
        for nested in graph.node(node).blocks().to_vec() {
            propagate_block(graph, nested)?;
        }
        let types = infer_node(graph, node)?;
        for (out, ty) in graph.node(node).outputs().to_vec().into_iter().zip(types) {
            graph.set_type(out, ty);
        }
    }
    Ok(())
}

// =============================================================================
// Node Rules
// =============================================================================

/// Computes the output types of one node from its current input types.
pub(crate) fn infer_node(graph: &Graph, id: NodeId) -> FuseResult<Vec<ValueType>> {
    let node = graph.node(id);
    let inputs: Vec<&ValueType> = node.inputs().iter().map(|&v| graph.value_type(v)).collect();
    let tensor = |i: usize| inputs.get(i).and_then(|t| t.as_tensor());
    let name = node.op.name();

    let single = |ty: Option<TensorType>| vec![ty.map_or(ValueType::Unknown, ValueType::Tensor)];

    let result = match &node.op {
        Op::Constant(value) => vec![value.value_type()],

        Op::Conv2d(params) => {
            let (Some(x), Some(w)) = (tensor(0), tensor(1)) else {
                return Ok(unknown(node.outputs().len()));
            };
            let mut dtypes = vec![x.dtype, w.dtype];
            dtypes.extend(tensor(2).map(|b| b.dtype));
            let dtype = float_dtype(name, &dtypes)?;
            let shape = match (&x.shape, &w.shape) {
                (Some(xs), Some(ws)) => Some(Shape::from_slice(&params.output_shape(xs, ws)?)),
                _ => None,
            };
            single(Some(dense_output(x, dtype, shape)))
        }

        Op::Linear => {
            let (Some(x), Some(w)) = (tensor(0), tensor(1)) else {
                return Ok(unknown(node.outputs().len()));
            };
            let mut dtypes = vec![x.dtype, w.dtype];
            dtypes.extend(tensor(2).map(|b| b.dtype));
            let dtype = float_dtype(name, &dtypes)?;
            let shape = match (&x.shape, &w.shape) {
                (Some(xs), Some(ws)) => {
                    if ws.len() != 2 || xs.last() != Some(&ws[1]) {
                        return Err(TensorError::shape_mismatch(xs, ws).into());
                    }
                    let mut out = Shape::from_slice(&xs[..xs.len() - 1]);
                    out.push(ws[0]);
                    Some(out)
                }
                _ => None,
            };
            single(Some(dense_output(x, dtype, shape)))
        }

        Op::MatMul | Op::Bmm => {
            let (Some(a), Some(b)) = (tensor(0), tensor(1)) else {
                return Ok(unknown(node.outputs().len()));
            };
            let dtype = float_dtype(name, &[a.dtype, b.dtype])?;
            let shape = match (&a.shape, &b.shape) {
                (Some(sa), Some(sb)) => {
                    if matches!(node.op, Op::Bmm) && (sa.len() != 3 || sb.len() != 3) {
                        return Err(FuseError::shape("bmm", format!("expects 3-d operands, got {sa:?} and {sb:?}")));
                    }
                    Some(matmul_shape(sa, sb)?)
                }
                _ => None,
            };
            single(Some(dense_output(a, dtype, shape)))
        }

        Op::BatchNorm { .. } | Op::Softmax { .. } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = float_dtype(name, &[x.dtype])?;
            single(Some(dense_output(x, dtype, x.shape.clone())))
        }

        Op::LayerNorm { normalized_shape, .. } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = float_dtype(name, &[x.dtype])?;
            let shape = normalized_shape.as_ref().and(x.shape.clone());
            single(Some(dense_output(x, dtype, shape)))
        }

        Op::Mean { dims, keepdim } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = float_dtype(name, &[x.dtype])?;
            let shape = match &x.shape {
                Some(s) => Some(reduced_shape(s, dims, *keepdim)?),
                None => None,
            };
            single(Some(dense_output(x, dtype, shape)))
        }

        Op::Cat { dim } => {
            let parts: Option<Vec<&TensorType>> = (0..inputs.len()).map(tensor).collect();
            let Some(parts) = parts.filter(|p| !p.is_empty()) else {
                return Ok(unknown(1));
            };
            let dtypes: Vec<DType> = parts.iter().map(|p| p.dtype).collect();
            let dtype = float_dtype(name, &dtypes)?;
            let shapes: Option<Vec<&Shape>> = parts.iter().map(|p| p.shape.as_ref()).collect();
            let shape = match shapes {
                Some(shapes) => Some(cat_shape(&shapes, *dim)?),
                None => None,
            };
            single(Some(dense_output(parts[0], dtype, shape)))
        }

        Op::MaxPool2d(params) => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            if !(x.dtype.is_floating() || x.dtype.is_quantized()) {
                return Err(unsupported(x.dtype, name));
            }
            let shape = match &x.shape {
                Some(s) => Some(Shape::from_slice(&params.output_shape(s)?)),
                None => None,
            };
            single(Some(dense_output(x, x.dtype, shape)))
        }

        Op::AvgPool2d { params, .. } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = float_dtype(name, &[x.dtype])?;
            let shape = match &x.shape {
                Some(s) => Some(Shape::from_slice(&params.output_shape(s)?)),
                None => None,
            };
            single(Some(dense_output(x, dtype, shape)))
        }

        Op::AdaptiveAvgPool2d { output_size } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = float_dtype(name, &[x.dtype])?;
            let shape = match &x.shape {
                Some(s) if s.len() == 4 => Some(Shape::from_slice(&[s[0], s[1], output_size[0], output_size[1]])),
                Some(s) => return Err(FuseError::shape(name, format!("expects a 4-d input, got {s:?}"))),
                None => None,
            };
            single(Some(dense_output(x, dtype, shape)))
        }

        Op::Unary { op, .. } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = if x.dtype.is_complex() && *op == onegraph_tensor::kernels::UnaryOp::Abs {
                DType::F32
            } else {
                float_dtype(name, &[x.dtype])?
            };
            single(Some(dense_output(x, dtype, x.shape.clone())))
        }

        Op::Clamp { .. } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let dtype = float_dtype(name, &[x.dtype])?;
            single(Some(dense_output(x, dtype, x.shape.clone())))
        }

        Op::Binary { op, .. } => match (inputs.first(), inputs.get(1)) {
            (Some(ValueType::Tensor(a)), Some(ValueType::Tensor(b))) => {
                let dtype = op.result_dtype(a.dtype, b.dtype).map_err(|_| FuseError::TypePromotion {
                    op: op.name(),
                    lhs: a.dtype,
                    rhs: b.dtype,
                })?;
                let shape = match (&a.shape, &b.shape) {
                    (Some(sa), Some(sb)) => Some(onegraph_tensor::shape::broadcast_shape(sa, sb)?),
                    _ => None,
                };
                single(Some(dense_output(a, dtype, shape)))
            }
            (Some(ValueType::Tensor(t)), Some(s)) | (Some(s), Some(ValueType::Tensor(t))) if s.is_scalar() => {
                if t.dtype.is_quantized() || t.dtype.is_complex() {
                    return Err(FuseError::TypePromotion {
                        op: op.name(),
                        lhs: t.dtype,
                        rhs: DType::F32,
                    });
                }
                let dtype = if *op == onegraph_tensor::kernels::BinaryOp::Gt {
                    DType::Bool
                } else if t.dtype.is_floating() {
                    t.dtype
                } else {
                    DType::F32
                };
                single(Some(dense_output(t, dtype, t.shape.clone())))
            }
            (Some(a), Some(b)) if a.is_scalar() && b.is_scalar() => {
                if *op == onegraph_tensor::kernels::BinaryOp::Gt {
                    vec![ValueType::Bool]
                } else {
                    vec![ValueType::Float]
                }
            }
            _ => unknown(1),
        },

        Op::View { shape: target } | Op::Reshape { shape: target } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let shape = match (target, &x.shape) {
                (Some(target), Some(s)) => Some(reshape(s, target)?),
                _ => None,
            };
            single(Some(TensorType {
                dtype: x.dtype,
                shape,
                layout: Layout::Contiguous,
            }))
        }

        Op::Permute { dims } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let shape = match &x.shape {
                Some(s) => Some(permute_shape(s, dims)?),
                None => None,
            };
            let identity = dims.iter().enumerate().all(|(i, &d)| i == d);
            single(Some(strided_view(x, shape, identity)))
        }

        Op::Transpose { dim0, dim1 } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let (shape, identity) = match &x.shape {
                Some(s) => {
                    let d0 = normalize_dim(*dim0, s.len())?;
                    let d1 = normalize_dim(*dim1, s.len())?;
                    let mut out = s.clone();
                    out.swap(d0, d1);
                    (Some(out), d0 == d1)
                }
                None => (None, false),
            };
            single(Some(strided_view(x, shape, identity)))
        }

        Op::Contiguous { layout } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            single(Some(TensorType {
                dtype: x.dtype,
                shape: x.shape.clone(),
                layout: *layout,
            }))
        }

        Op::Select { dim, index } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            let (shape, leading) = match &x.shape {
                Some(s) => {
                    let d = normalize_dim(*dim, s.len())?;
                    let size = s[d] as i64;
                    if *index >= size || *index < -size {
                        return Err(TensorError::IndexOutOfBounds {
                            index: *index,
                            size: s[d],
                        }
                        .into());
                    }
                    let mut out = s.clone();
                    out.remove(d);
                    (Some(out), d == 0)
                }
                None => (None, false),
            };
            single(Some(strided_view(x, shape, leading)))
        }

        Op::Size { dim } => match dim {
            Some(_) => vec![ValueType::Int],
            None => vec![ValueType::IntList],
        },

        Op::ListConstruct => {
            if inputs.iter().all(|t| matches!(t, ValueType::Int)) {
                vec![ValueType::IntList]
            } else {
                vec![ValueType::List]
            }
        }

        Op::To { dtype } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            if x.dtype.is_quantized() || dtype.is_quantized() || x.dtype.is_complex() != dtype.is_complex() {
                return Err(unsupported(x.dtype, name));
            }
            single(Some(dense_output(x, *dtype, x.shape.clone())))
        }

        Op::QuantizePerTensor { dtype, .. } | Op::QuantizePerChannel { dtype, .. } => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            if !x.dtype.is_floating() {
                return Err(unsupported(x.dtype, name));
            }
            if !dtype.is_quantized() {
                return Err(unsupported(*dtype, name));
            }
            single(Some(dense_output(x, *dtype, x.shape.clone())))
        }

        Op::Dequantize => {
            let Some(x) = tensor(0) else {
                return Ok(unknown(1));
            };
            if !x.dtype.is_quantized() {
                return Err(unsupported(x.dtype, name));
            }
            single(Some(TensorType {
                dtype: DType::F32,
                shape: x.shape.clone(),
                layout: x.layout,
            }))
        }

        Op::If => {
            let branches: Vec<Vec<ValueType>> = node
                .blocks()
                .iter()
                .map(|&b| graph.block_returns(b).iter().map(|&v| graph.value_type(v).clone()).collect())
                .collect();
            (0..node.outputs().len())
                .map(|i| {
                    let mut merged: Option<ValueType> = None;
                    for branch in &branches {
                        let ty = branch.get(i).cloned().unwrap_or(ValueType::Unknown);
                        merged = Some(match merged {
                            None => ty,
                            Some(prev) => merge_types(prev, ty),
                        });
                    }
                    merged.unwrap_or(ValueType::Unknown)
                })
                .collect()
        }

        Op::FusionGroup(group) => {
            let types: Vec<ValueType> = inputs.iter().map(|&t| t.clone()).collect();
            infer_group(group, &types)?
        }
    };
    Ok(result)
}

// =============================================================================
// Helpers
// =============================================================================

fn unknown(n: usize) -> Vec<ValueType> {
    vec![ValueType::Unknown; n]
}

fn unsupported(dtype: DType, op: &'static str) -> FuseError {
    TensorError::UnsupportedDType { dtype, op }.into()
}

/// Promotes floating operand dtypes, rejecting any other dtype.
fn float_dtype(op: &'static str, dtypes: &[DType]) -> FuseResult<DType> {
    let mut result: Option<DType> = None;
    for &dtype in dtypes {
        if !dtype.is_floating() {
            return Err(match result {
                Some(prev) if dtype.is_quantized() => FuseError::TypePromotion {
                    op,
                    lhs: prev,
                    rhs: dtype,
                },
                _ => unsupported(dtype, op),
            });
        }
        result = Some(match result {
            None => dtype,
            Some(prev) => prev.promote(dtype).unwrap_or(DType::F32),
        });
    }
    Ok(result.unwrap_or(DType::F32))
}

/// Output of a kernel that writes a fresh dense tensor.
fn dense_output(input: &TensorType, dtype: DType, shape: Option<Shape>) -> TensorType {
    let layout = match input.layout {
        Layout::ChannelsLast => Layout::ChannelsLast,
        _ => Layout::Contiguous,
    };
    TensorType { dtype, shape, layout }
}

/// Output of a view that may leave its storage non-contiguous.
fn strided_view(input: &TensorType, shape: Option<Shape>, keeps_order: bool) -> TensorType {
    let layout = if keeps_order && input.layout == Layout::Contiguous {
        Layout::Contiguous
    } else {
        Layout::Strided
    };
    TensorType {
        dtype: input.dtype,
        shape,
        layout,
    }
}

fn cat_shape(shapes: &[&Shape], dim: i64) -> FuseResult<Shape> {
    let first = shapes[0];
    let d = normalize_dim(dim, first.len())?;
    let mut out = first.clone();
    out[d] = 0;
    for s in shapes {
        let compatible = s.len() == first.len()
            && s.iter().zip(first.iter()).enumerate().all(|(i, (a, b))| i == d || a == b);
        if !compatible {
            return Err(TensorError::shape_mismatch(first, s).into());
        }
        out[d] += s[d];
    }
    Ok(out)
}

fn merge_types(a: ValueType, b: ValueType) -> ValueType {
    match (a, b) {
        (a, b) if a == b => a,
        (ValueType::Tensor(x), ValueType::Tensor(y)) if x.dtype == y.dtype => ValueType::Tensor(TensorType {
            dtype: x.dtype,
            shape: if x.shape == y.shape { x.shape } else { None },
            layout: if x.layout == y.layout { x.layout } else { Layout::Strided },
        }),
        _ => ValueType::Unknown,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::trace;
    use onegraph_tensor::kernels::Conv2dParams;
    use onegraph_tensor::Tensor;

    fn output_type(graph: &Graph, i: usize) -> ValueType {
        graph.value_type(graph.outputs()[i]).clone()
    }

    #[test]
    fn test_conv_relu_shapes() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[1, 3, 8, 8]);
            let w = t.constant(Tensor::zeros(&[4, 3, 3, 3]));
            vec![x.conv2d(&w, None, Conv2dParams::default().padding(1)).relu()]
        });
        propagate(&mut graph).unwrap();
        assert_eq!(output_type(&graph, 0), ValueType::tensor(DType::F32, &[1, 4, 8, 8]));
    }

    #[test]
    fn test_linear_and_view() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 3, 4]);
            let w = t.constant(Tensor::zeros(&[5, 4]));
            vec![x.linear(&w, None).view(&[-1, 5])]
        });
        propagate(&mut graph).unwrap();
        assert_eq!(output_type(&graph, 0), ValueType::tensor(DType::F32, &[6, 5]));
    }

    #[test]
    fn test_dynamic_view_is_unknown() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 6]);
            let n = x.size(0);
            let m = t.int(-1);
            let shape = t.list(&[n, m]);
            vec![x.view_dynamic(&shape)]
        });
        propagate(&mut graph).unwrap();
        let ty = output_type(&graph, 0);
        assert_eq!(ty.as_tensor().unwrap().shape, None);
    }

    #[test]
    fn test_quantized_float_add_is_rejected() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[4]);
            let q = x.quantize_per_tensor(0.1, 0, DType::QUInt8);
            vec![q.add(&x)]
        });
        let err = propagate(&mut graph).unwrap_err();
        assert!(matches!(err, FuseError::TypePromotion { .. }));
    }

    #[test]
    fn test_permute_marks_strided() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::BF16, &[2, 3]);
            vec![x.permute(&[1, 0]), x.permute(&[1, 0]).contiguous(Layout::Contiguous)]
        });
        propagate(&mut graph).unwrap();
        let strided = output_type(&graph, 0);
        let dense = output_type(&graph, 1);
        assert_eq!(strided.as_tensor().unwrap().layout, Layout::Strided);
        assert_eq!(dense.as_tensor().unwrap().layout, Layout::Contiguous);
        assert_eq!(dense.as_tensor().unwrap().dtype, DType::BF16);
    }

    #[test]
    fn test_propagate_with_inputs_overrides_declared() {
        let mut graph = trace(|t| {
            let x = t.input_unshaped("x", DType::F32);
            vec![x.relu()]
        });
        propagate(&mut graph).unwrap();
        assert_eq!(output_type(&graph, 0).as_tensor().unwrap().shape, None);

        let example = RtValue::Tensor(Tensor::zeros(&[3, 2]));
        propagate_with_inputs(&mut graph, &[example]).unwrap();
        assert_eq!(output_type(&graph, 0), ValueType::tensor(DType::F32, &[3, 2]));
        assert!(propagate_with_inputs(&mut graph, &[]).is_err());
    }

    #[test]
    fn test_propagate_is_idempotent() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[2, 4]);
            vec![x.softmax(-1).mean(&[1], true)]
        });
        propagate(&mut graph).unwrap();
        let first = output_type(&graph, 0);
        propagate(&mut graph).unwrap();
        assert_eq!(first, output_type(&graph, 0));
        assert_eq!(first, ValueType::tensor(DType::F32, &[2, 1]));
    }

    #[test]
    fn test_if_merges_branch_types() {
        let mut graph = trace(|t| {
            let x = t.input("x", DType::F32, &[4]);
            let c = t.input_typed("c", ValueType::Bool);
            t.if_then_else(&c, |_| vec![x.relu()], |_| vec![x.view(&[2, 2])]).unwrap()
        });
        propagate(&mut graph).unwrap();
        let ty = output_type(&graph, 0);
        assert_eq!(ty.as_tensor().unwrap().dtype, DType::F32);
        assert_eq!(ty.as_tensor().unwrap().shape, None);
    }
}

//! Reference Kernels
//!
//! Straightforward implementations of every operator the graph IR can
//! express. They define the numerical semantics that fused partitions must
//! reproduce: each kernel computes in `f32` and rounds its result to the
//! output dtype, so bf16 graphs behave like bf16 hardware with f32
//! accumulation.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

pub mod conv;
pub mod elementwise;
pub mod matmul;
pub mod norm;
pub mod pool;
pub mod quantize;
pub mod reduce;

pub use conv::{conv2d, Conv2dParams};
pub use elementwise::{binary, binary_scalar, clamp, unary, BinaryOp, UnaryOp};
pub use matmul::{bmm, linear, matmul};
pub use norm::{batch_norm, layer_norm, softmax};
pub use pool::{adaptive_avg_pool2d, avg_pool2d, max_pool2d, PoolParams};
pub use quantize::{dequantize, quantize_per_channel, quantize_per_tensor};
pub use reduce::{cat, mean};

use crate::dtype::DType;
use crate::error::{TensorError, TensorResult};
use crate::shape::Layout;
use crate::tensor::{dense_layout, round_in_place, Tensor};

// =============================================================================
// Shared Helpers
// =============================================================================

/// Returns the values of a floating point tensor, rejecting other dtypes.
pub(crate) fn float_values(t: &Tensor, op: &'static str) -> TensorResult<Vec<f32>> {
    if !t.dtype().is_floating() {
        return Err(TensorError::UnsupportedDType {
            dtype: t.dtype(),
            op,
        });
    }
    Ok(t.to_vec())
}

/// Promotes the dtypes of all floating operands of a kernel.
pub(crate) fn float_result_dtype(inputs: &[&Tensor], op: &'static str) -> TensorResult<DType> {
    let mut dtype: Option<DType> = None;
    for t in inputs {
        if !t.dtype().is_floating() {
            return Err(TensorError::UnsupportedDType {
                dtype: t.dtype(),
                op,
            });
        }
        dtype = Some(match dtype {
            None => t.dtype(),
            Some(d) => d.promote(t.dtype()).ok_or(TensorError::TypePromotion {
                lhs: d,
                rhs: t.dtype(),
            })?,
        });
    }
    Ok(dtype.unwrap_or(DType::F32))
}

/// Builds a dense kernel result, rounding to the output dtype.
pub(crate) fn finish(mut data: Vec<f32>, shape: &[usize], dtype: DType, layout: Layout) -> Tensor {
    round_in_place(&mut data, dtype);
    Tensor::dense(data, shape, dtype, None).with_layout(dense_layout(layout))
}

/// Requires a tensor of exactly `rank` dimensions.
pub(crate) fn expect_rank(t: &Tensor, rank: usize, op: &str) -> TensorResult<()> {
    if t.ndim() != rank {
        return Err(TensorError::invalid_operation(format!(
            "{op} expects a {rank}-d tensor, got shape {:?}",
            t.shape()
        )));
    }
    Ok(())
}

//! Shape and Strides - Tensor Dimension Management
//!
//! Shapes, strides, memory layout tags and broadcasting rules shared by the
//! tensor type, the reference kernels and the graph shape propagator.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{TensorError, TensorResult};

// =============================================================================
// Type Aliases
// =============================================================================

/// Shape type - dimensions of a tensor.
/// Uses `SmallVec` for stack allocation of small shapes (up to 6 dimensions).
pub type Shape = SmallVec<[usize; 6]>;

/// Strides type - step sizes for each dimension.
pub type Strides = SmallVec<[isize; 6]>;

// =============================================================================
// Layout
// =============================================================================

/// Memory layout tag of a tensor or graph value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Dense row-major.
    Contiguous,
    /// Dense channel-last (NHWC order for 4-d tensors).
    ChannelsLast,
    /// Any other strided arrangement, e.g. a permuted view.
    Strided,
}

impl Default for Layout {
    fn default() -> Self {
        Self::Contiguous
    }
}

// =============================================================================
// Shape Utilities
// =============================================================================

/// Computes the total number of elements from a shape.
#[must_use]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Computes row-major (C-order) strides for a shape.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Strides {
    let mut strides = Strides::with_capacity(shape.len());
    let mut stride = 1isize;

    for &dim in shape.iter().rev() {
        strides.push(stride);
        stride *= dim.max(1) as isize;
    }

    strides.reverse();
    strides
}

/// Checks if strides represent a contiguous memory layout.
#[must_use]
pub fn is_contiguous(shape: &[usize], strides: &[isize]) -> bool {
    let expected = contiguous_strides(shape);
    shape
        .iter()
        .zip(strides.iter().zip(expected.iter()))
        .all(|(&dim, (&s, &e))| dim <= 1 || s == e)
}

/// Computes the storage offset from multi-dimensional indices.
#[must_use]
pub fn linear_index(indices: &[usize], strides: &[isize]) -> isize {
    debug_assert_eq!(indices.len(), strides.len());

    indices
        .iter()
        .zip(strides.iter())
        .map(|(&idx, &stride)| idx as isize * stride)
        .sum()
}

/// Converts a linear index to multi-dimensional indices.
#[must_use]
pub fn unravel_index(mut linear: usize, shape: &[usize]) -> Shape {
    let mut indices: Shape = smallvec::smallvec![0; shape.len()];

    for (i, &dim) in shape.iter().enumerate().rev() {
        if dim == 0 {
            continue;
        }
        indices[i] = linear % dim;
        linear /= dim;
    }

    indices
}

/// Normalizes a possibly negative dimension index.
pub fn normalize_dim(dim: i64, ndim: usize) -> TensorResult<usize> {
    let resolved = if dim < 0 { dim + ndim as i64 } else { dim };
    if resolved < 0 || resolved >= ndim as i64 {
        return Err(TensorError::InvalidDimension { index: dim, ndim });
    }
    Ok(resolved as usize)
}

// =============================================================================
// Broadcasting
// =============================================================================

/// Computes the broadcast shape of two shapes following `NumPy` rules.
pub fn broadcast_shape(shape1: &[usize], shape2: &[usize]) -> TensorResult<Shape> {
    let max_ndim = shape1.len().max(shape2.len());
    let mut result = Shape::with_capacity(max_ndim);

    for i in 0..max_ndim {
        let d1 = if i < shape1.len() {
            shape1[shape1.len() - 1 - i]
        } else {
            1
        };
        let d2 = if i < shape2.len() {
            shape2[shape2.len() - 1 - i]
        } else {
            1
        };

        if d1 == d2 || d2 == 1 {
            result.push(d1);
        } else if d1 == 1 {
            result.push(d2);
        } else {
            return Err(TensorError::BroadcastError {
                shape1: shape1.to_vec(),
                shape2: shape2.to_vec(),
            });
        }
    }

    result.reverse();
    Ok(result)
}

/// Computes broadcast strides for a shape to match a target shape.
#[must_use]
pub fn broadcast_strides(shape: &[usize], strides: &[isize], target_shape: &[usize]) -> Strides {
    let mut result = Strides::with_capacity(target_shape.len());
    let shape_offset = target_shape.len() - shape.len();

    for (i, &target_dim) in target_shape.iter().enumerate() {
        if i < shape_offset {
            result.push(0);
        } else {
            let orig_idx = i - shape_offset;
            if shape[orig_idx] == target_dim {
                result.push(strides[orig_idx]);
            } else {
                result.push(0);
            }
        }
    }

    result
}

// =============================================================================
// Shape Manipulation
// =============================================================================

/// Resolves a reshape target, supporting a single inferred `-1` dimension.
pub fn reshape(old_shape: &[usize], new_shape: &[i64]) -> TensorResult<Shape> {
    let old_numel = numel(old_shape);
    let mut result = Shape::with_capacity(new_shape.len());
    let mut infer_idx = None;
    let mut known_numel = 1usize;

    for (i, &dim) in new_shape.iter().enumerate() {
        if dim == -1 {
            if infer_idx.is_some() {
                return Err(TensorError::invalid_operation(
                    "Can only have one -1 in reshape",
                ));
            }
            infer_idx = Some(i);
            result.push(0);
        } else if dim < 0 {
            return Err(TensorError::invalid_operation(
                "Invalid dimension in reshape",
            ));
        } else {
            known_numel *= dim as usize;
            result.push(dim as usize);
        }
    }

    if let Some(idx) = infer_idx {
        if known_numel == 0 || old_numel % known_numel != 0 {
            return Err(TensorError::invalid_operation(
                "Cannot infer dimension: not evenly divisible",
            ));
        }
        result[idx] = old_numel / known_numel;
    } else if known_numel != old_numel {
        return Err(TensorError::shape_mismatch(old_shape, &result));
    }

    Ok(result)
}

/// Validates a permutation and returns the permuted shape.
pub fn permute_shape(shape: &[usize], dims: &[usize]) -> TensorResult<Shape> {
    if dims.len() != shape.len() {
        return Err(TensorError::invalid_operation(format!(
            "Expected {} dimensions in permute, got {}",
            shape.len(),
            dims.len()
        )));
    }

    let mut seen = vec![false; shape.len()];
    for &d in dims {
        if d >= shape.len() {
            return Err(TensorError::InvalidDimension {
                index: d as i64,
                ndim: shape.len(),
            });
        }
        if seen[d] {
            return Err(TensorError::invalid_operation(
                "Duplicate dimension in permute",
            ));
        }
        seen[d] = true;
    }

    Ok(dims.iter().map(|&d| shape[d]).collect())
}

/// Computes the output spatial extent of a sliding window.
#[must_use]
pub fn window_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    ceil_mode: bool,
) -> usize {
    let effective = dilation * (kernel.max(1) - 1) + 1;
    let padded = input + 2 * padding;
    if padded < effective {
        return 0;
    }
    let span = padded - effective;
    let stride = stride.max(1);
    let mut out = if ceil_mode {
        span.div_ceil(stride) + 1
    } else {
        span / stride + 1
    };
    // The last window must start inside the input or the left padding.
    if ceil_mode && (out - 1) * stride >= input + padding {
        out -= 1;
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

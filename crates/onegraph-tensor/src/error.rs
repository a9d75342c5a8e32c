//! Error Types - Tensor Error Handling
//!
//! Errors raised by tensor construction, views and the reference kernels.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

use crate::dtype::DType;

// =============================================================================
// Error Types
// =============================================================================

/// Result type for tensor operations.
pub type TensorResult<T> = Result<T, TensorError>;

/// Errors produced by tensor operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    /// Shape mismatch between operands.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        actual: Vec<usize>,
    },

    /// Shapes cannot be broadcast together.
    #[error("Cannot broadcast shapes {shape1:?} and {shape2:?}")]
    BroadcastError {
        /// First shape.
        shape1: Vec<usize>,
        /// Second shape.
        shape2: Vec<usize>,
    },

    /// Invalid dimension index.
    #[error("Invalid dimension: index {index} for tensor with {ndim} dimensions")]
    InvalidDimension {
        /// The invalid dimension index.
        index: i64,
        /// Number of dimensions in the tensor.
        ndim: usize,
    },

    /// Index out of bounds.
    #[error("Index out of bounds: index {index} for dimension of size {size}")]
    IndexOutOfBounds {
        /// The invalid index.
        index: i64,
        /// The size of the dimension.
        size: usize,
    },

    /// Type promotion is undefined for the operand dtypes.
    #[error("Type promotion of {lhs:?} and {rhs:?} is not defined")]
    TypePromotion {
        /// Left operand dtype.
        lhs: DType,
        /// Right operand dtype.
        rhs: DType,
    },

    /// The kernel does not accept this dtype.
    #[error("Unsupported dtype {dtype:?} for {op}")]
    UnsupportedDType {
        /// The offending dtype.
        dtype: DType,
        /// Kernel name.
        op: &'static str,
    },

    /// Missing or inconsistent quantization parameters.
    #[error("Quantization error: {0}")]
    Quantization(String),

    /// Data length does not match the shape.
    #[error("Data length mismatch: expected {expected}, got {actual}")]
    DataLengthMismatch {
        /// Expected number of elements.
        expected: usize,
        /// Actual number of elements.
        actual: usize,
    },

    /// Invalid operation.
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Description of the error.
        message: String,
    },
}

impl TensorError {
    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates an invalid operation error.
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Fuser Error Types
//!
//! Error handling for graph rewriting, partition compilation and execution.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::{DType, TensorError};
use thiserror::Error;

/// Result type for fuser operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Errors raised by the fusion pipeline and the partition executor.
#[derive(Error, Debug, Clone)]
pub enum FuseError {
    /// Graph structure violates an IR invariant.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Binary operands have no defined type promotion.
    #[error("Type promotion of {lhs} and {rhs} is not defined for {op}")]
    TypePromotion {
        /// Operator name.
        op: &'static str,
        /// Left operand dtype.
        lhs: DType,
        /// Right operand dtype.
        rhs: DType,
    },

    /// Shapes are inconsistent with the operator.
    #[error("Shape inference failed for {op}: {message}")]
    ShapeInference {
        /// Operator name.
        op: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Calibration data is missing or unusable.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// The kernel compiler rejected a partition.
    #[error("Compilation of {group} failed: {message}")]
    Compilation {
        /// Fusion group name.
        group: String,
        /// Compiler message.
        message: String,
    },

    /// A compiled partition was invoked with inputs outside its signature.
    #[error("Signature mismatch: compiled for {expected}, invoked with {found}")]
    SignatureMismatch {
        /// Signature the kernel was compiled for.
        expected: String,
        /// Signature of the actual inputs.
        found: String,
    },

    /// Wrong number of graph inputs.
    #[error("Input count mismatch: expected {expected}, got {found}")]
    InputCount {
        /// Declared inputs.
        expected: usize,
        /// Provided inputs.
        found: usize,
    },

    /// A runtime value had the wrong kind.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Error from a reference kernel.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl FuseError {
    /// Creates an invalid graph error.
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self::InvalidGraph(message.into())
    }

    /// Creates a runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Creates a shape inference error.
    pub fn shape(op: &'static str, message: impl Into<String>) -> Self {
        Self::ShapeInference {
            op,
            message: message.into(),
        }
    }

    /// Returns true for the error a compiled partition raises on a shape guard miss.
    #[must_use]
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self, Self::SignatureMismatch { .. })
    }
}

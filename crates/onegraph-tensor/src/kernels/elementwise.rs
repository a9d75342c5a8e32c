//! Elementwise Kernels
//!
//! Unary activations, clamp and broadcasting binary arithmetic.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{finish, float_values};
use crate::dtype::DType;
use crate::error::{TensorError, TensorResult};
use crate::shape::broadcast_shape;
use crate::tensor::Tensor;

/// Tensors above this size are processed in parallel.
const PARALLEL_THRESHOLD: usize = 4096;

// =============================================================================
// Unary Operations
// =============================================================================

/// Elementwise unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// max(x, 0).
    Relu,
    /// Logistic sigmoid.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
    /// GELU, tanh approximation.
    Gelu,
    /// x * sigmoid(x).
    Silu,
    /// x * tanh(softplus(x)).
    Mish,
    /// Exponential linear unit.
    Elu {
        /// Negative-side scale.
        alpha: f32,
    },
    /// Leaky ReLU.
    LeakyRelu {
        /// Negative-side slope.
        slope: f32,
    },
    /// x * relu6(x + 3) / 6.
    Hardswish,
    /// relu6(x + 3) / 6.
    Hardsigmoid,
    /// Clamp to a fixed range.
    Hardtanh {
        /// Lower bound.
        min: f32,
        /// Upper bound.
        max: f32,
    },
    /// Round half to even.
    Round,
    /// Absolute value; magnitude for complex input.
    Abs,
    /// x * x.
    Square,
    /// Exponential.
    Exp,
    /// Natural logarithm.
    Log,
    /// Square root.
    Sqrt,
    /// Negation.
    Neg,
}

impl UnaryOp {
    /// Applies the operator to one value.
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Gelu => {
                let c = (2.0_f32 / core::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044_715 * x * x * x)).tanh())
            }
            Self::Silu => x / (1.0 + (-x).exp()),
            Self::Mish => x * x.exp().ln_1p().tanh(),
            Self::Elu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            Self::LeakyRelu { slope } => {
                if x > 0.0 {
                    x
                } else {
                    slope * x
                }
            }
            Self::Hardswish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
            Self::Hardsigmoid => (x + 3.0).clamp(0.0, 6.0) / 6.0,
            Self::Hardtanh { min, max } => x.clamp(min, max),
            Self::Round => x.round_ties_even(),
            Self::Abs => x.abs(),
            Self::Square => x * x,
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Neg => -x,
        }
    }

    /// Returns the operator name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Gelu => "gelu",
            Self::Silu => "silu",
            Self::Mish => "mish",
            Self::Elu { .. } => "elu",
            Self::LeakyRelu { .. } => "leaky_relu",
            Self::Hardswish => "hardswish",
            Self::Hardsigmoid => "hardsigmoid",
            Self::Hardtanh { .. } => "hardtanh",
            Self::Round => "round",
            Self::Abs => "abs",
            Self::Square => "square",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Neg => "neg",
        }
    }
}

fn map_values(data: &[f32], f: impl Fn(f32) -> f32 + Sync + Send) -> Vec<f32> {
    if data.len() >= PARALLEL_THRESHOLD {
        data.par_iter().map(|&x| f(x)).collect()
    } else {
        data.iter().map(|&x| f(x)).collect()
    }
}

/// Applies a unary operator elementwise.
pub fn unary(t: &Tensor, op: UnaryOp) -> TensorResult<Tensor> {
    if t.dtype().is_complex() {
        if op != UnaryOp::Abs {
            return Err(TensorError::UnsupportedDType {
                dtype: t.dtype(),
                op: op.name(),
            });
        }
        let pairs = t.to_vec();
        let data = pairs.chunks(2).map(|c| c[0].hypot(c[1])).collect();
        return Ok(finish(data, t.shape(), DType::F32, t.layout()));
    }
    let data = float_values(t, op.name())?;
    Ok(finish(map_values(&data, |x| op.apply(x)), t.shape(), t.dtype(), t.layout()))
}

/// Clamps values to optional bounds.
pub fn clamp(t: &Tensor, min: Option<f32>, max: Option<f32>) -> TensorResult<Tensor> {
    let data = float_values(t, "clamp")?;
    let lo = min.unwrap_or(f32::NEG_INFINITY);
    let hi = max.unwrap_or(f32::INFINITY);
    Ok(finish(
        map_values(&data, |x| x.max(lo).min(hi)),
        t.shape(),
        t.dtype(),
        t.layout(),
    ))
}

// =============================================================================
// Binary Operations
// =============================================================================

/// Broadcasting binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Elementwise maximum.
    Maximum,
    /// Greater-than comparison producing bool.
    Gt,
}

impl BinaryOp {
    /// Applies the operator to one pair of values.
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Maximum => a.max(b),
            Self::Gt => {
                if a > b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Returns the operator name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Maximum => "maximum",
            Self::Gt => "gt",
        }
    }

    /// Returns the right operand value that makes the operator an identity.
    #[must_use]
    pub fn identity_operand(self) -> Option<f32> {
        match self {
            Self::Add | Self::Sub => Some(0.0),
            Self::Mul | Self::Div => Some(1.0),
            Self::Maximum | Self::Gt => None,
        }
    }

    /// Result dtype for the given operand dtypes.
    pub fn result_dtype(self, lhs: DType, rhs: DType) -> TensorResult<DType> {
        let promoted = lhs
            .promote(rhs)
            .ok_or(TensorError::TypePromotion { lhs, rhs })?;
        if promoted.is_complex() {
            return Err(TensorError::UnsupportedDType {
                dtype: promoted,
                op: self.name(),
            });
        }
        Ok(if self == Self::Gt { DType::Bool } else { promoted })
    }
}

/// Applies a binary operator with broadcasting and type promotion.
pub fn binary(a: &Tensor, b: &Tensor, op: BinaryOp) -> TensorResult<Tensor> {
    let dtype = op.result_dtype(a.dtype(), b.dtype())?;
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let lhs = a.broadcast_values(&shape)?;
    let rhs = b.broadcast_values(&shape)?;
    let data = lhs.iter().zip(rhs.iter()).map(|(&x, &y)| op.apply(x, y)).collect();
    Ok(finish(data, &shape, dtype, a.layout()))
}

/// Applies a binary operator between a tensor and a scalar.
///
/// With `scalar_first` the scalar is the left operand.
pub fn binary_scalar(t: &Tensor, scalar: f32, op: BinaryOp, scalar_first: bool) -> TensorResult<Tensor> {
    if t.dtype().is_quantized() || t.dtype().is_complex() {
        return Err(TensorError::UnsupportedDType {
            dtype: t.dtype(),
            op: op.name(),
        });
    }
    let dtype = if op == BinaryOp::Gt {
        DType::Bool
    } else if t.dtype().is_floating() {
        t.dtype()
    } else {
        DType::F32
    };
    let data = t.to_vec();
    let out = map_values(&data, |x| {
        if scalar_first {
            op.apply(scalar, x)
        } else {
            op.apply(x, scalar)
        }
    });
    Ok(finish(out, t.shape(), dtype, t.layout()))
}

// =============================================================================
// Tests
// =============================================================================

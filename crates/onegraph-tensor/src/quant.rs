//! Quantization Parameters
//!
//! Affine quantization parameters carried by 8-bit quantized tensors, per
//! tensor or per channel along an axis, and the scalar quantize/dequantize
//! formulas used by the kernels.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{TensorError, TensorResult};

// =============================================================================
// QParams
// =============================================================================

/// Scale and zero point of a quantized tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QParams {
    /// One scale and zero point for the whole tensor.
    PerTensor {
        /// Step between adjacent integer levels.
        scale: f32,
        /// Integer level representing real zero.
        zero_point: i32,
    },
    /// One scale and zero point per slice along `axis`.
    PerChannel {
        /// Per-channel scales.
        scales: Vec<f32>,
        /// Per-channel zero points.
        zero_points: Vec<i32>,
        /// Channel axis.
        axis: usize,
    },
}

impl QParams {
    /// Creates per-tensor parameters.
    #[must_use]
    pub fn per_tensor(scale: f32, zero_point: i32) -> Self {
        Self::PerTensor { scale, zero_point }
    }

    /// Creates per-channel parameters, validating that lengths agree.
    pub fn per_channel(scales: Vec<f32>, zero_points: Vec<i32>, axis: usize) -> TensorResult<Self> {
        if scales.len() != zero_points.len() {
            return Err(TensorError::Quantization(format!(
                "{} scales but {} zero points",
                scales.len(),
                zero_points.len()
            )));
        }
        Ok(Self::PerChannel {
            scales,
            zero_points,
            axis,
        })
    }

    /// Returns true for per-tensor parameters.
    #[must_use]
    pub fn is_per_tensor(&self) -> bool {
        matches!(self, Self::PerTensor { .. })
    }

    /// Returns the (scale, zero point) for a channel index.
    #[must_use]
    pub fn channel(&self, index: usize) -> (f32, i32) {
        match self {
            Self::PerTensor { scale, zero_point } => (*scale, *zero_point),
            Self::PerChannel {
                scales,
                zero_points,
                ..
            } => (scales[index], zero_points[index]),
        }
    }

    /// Returns the channel axis of per-channel parameters.
    #[must_use]
    pub fn axis(&self) -> Option<usize> {
        match self {
            Self::PerTensor { .. } => None,
            Self::PerChannel { axis, .. } => Some(*axis),
        }
    }

    /// Returns the parameters after the tensor dimensions are reordered.
    #[must_use]
    pub fn permuted(&self, dims: &[usize]) -> Self {
        match self {
            Self::PerTensor { .. } => self.clone(),
            Self::PerChannel {
                scales,
                zero_points,
                axis,
            } => Self::PerChannel {
                scales: scales.clone(),
                zero_points: zero_points.clone(),
                axis: dims.iter().position(|&d| d == *axis).unwrap_or(*axis),
            },
        }
    }
}

// =============================================================================
// Scalar Formulas
// =============================================================================

/// Quantizes one value, rounding half to even and clamping to `[qmin, qmax]`.
#[must_use]
pub fn quantize_value(x: f32, scale: f32, zero_point: i32, qmin: i32, qmax: i32) -> f32 {
    let level = (x / scale).round_ties_even() + zero_point as f32;
    level.clamp(qmin as f32, qmax as f32)
}

/// Maps one integer level back to a real value.
#[must_use]
pub fn dequantize_value(q: f32, scale: f32, zero_point: i32) -> f32 {
    (q - zero_point as f32) * scale
}

/// Returns the full integer range of a quantized dtype.
pub fn dtype_range(dtype: DType) -> TensorResult<(i32, i32)> {
    dtype
        .quant_range(false)
        .ok_or(TensorError::UnsupportedDType {
            dtype,
            op: "quantize",
        })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_value() {
        assert_eq!(quantize_value(0.5, 0.1, 0, -128, 127), 5.0);
        assert_eq!(quantize_value(100.0, 0.1, 0, -128, 127), 127.0);
        assert_eq!(quantize_value(-1.0, 0.1, 10, 0, 255), 0.0);
        // halfway cases round to even
        assert_eq!(quantize_value(0.25, 0.1, 0, -128, 127), 2.0);
    }

    #[test]
    fn test_dequantize_value() {
        assert!((dequantize_value(5.0, 0.1, 0) - 0.5).abs() < 1e-6);
        assert!((dequantize_value(12.0, 0.5, 10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_per_channel_validation() {
        assert!(QParams::per_channel(vec![0.1, 0.2], vec![0], 0).is_err());
        let params = QParams::per_channel(vec![0.1, 0.2], vec![0, 0], 1).unwrap();
        assert_eq!(params.channel(1), (0.2, 0));
        assert_eq!(params.permuted(&[1, 0]).axis(), Some(0));
    }
}

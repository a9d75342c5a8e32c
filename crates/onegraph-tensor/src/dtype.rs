//! Data Types - Element Type System
//!
//! Runtime dtype tags for tensors and graph values: single precision,
//! bfloat16, the two 8-bit quantized integer types, int64, bool and
//! complex64. Also defines the type promotion table used by binary kernels
//! and by the graph type propagator.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use serde::{Deserialize, Serialize};

// =============================================================================
// DType Enum
// =============================================================================

/// Runtime representation of tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit brain floating point.
    BF16,
    /// Signed 8-bit quantized integer (scale and zero point attached).
    QInt8,
    /// Unsigned 8-bit quantized integer (scale and zero point attached).
    QUInt8,
    /// 64-bit signed integer.
    I64,
    /// Boolean.
    Bool,
    /// Complex number with two 32-bit float components.
    Complex64,
}

impl DType {
    /// Returns the size in bytes of one element.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::QInt8 | Self::QUInt8 | Self::Bool => 1,
            Self::BF16 => 2,
            Self::F32 => 4,
            Self::I64 | Self::Complex64 => 8,
        }
    }

    /// Returns true for the floating point types.
    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::F32 | Self::BF16)
    }

    /// Returns true for the narrow quantized integer types.
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::QInt8 | Self::QUInt8)
    }

    /// Returns true for complex types.
    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::Complex64)
    }

    /// Returns the short name of the dtype.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::BF16 => "bf16",
            Self::QInt8 => "qint8",
            Self::QUInt8 => "quint8",
            Self::I64 => "i64",
            Self::Bool => "bool",
            Self::Complex64 => "complex64",
        }
    }

    /// Returns the representable integer range of a quantized dtype.
    ///
    /// With `reduce_range` one bit of headroom is given up, matching
    /// kernels that accumulate in 16 bits.
    #[must_use]
    pub const fn quant_range(self, reduce_range: bool) -> Option<(i32, i32)> {
        match (self, reduce_range) {
            (Self::QInt8, false) => Some((-128, 127)),
            (Self::QInt8, true) => Some((-64, 63)),
            (Self::QUInt8, false) => Some((0, 255)),
            (Self::QUInt8, true) => Some((0, 127)),
            _ => None,
        }
    }

    /// Promotes two operand dtypes to the result dtype of a binary op.
    ///
    /// Returns `None` when the combination has no defined promotion, which
    /// is the case for any mixture involving a quantized type.
    #[must_use]
    pub fn promote(self, other: Self) -> Option<Self> {
        if self.is_quantized() || other.is_quantized() {
            return None;
        }
        if self == other {
            return Some(self);
        }
        Some(self.max_rank(other))
    }

    fn rank(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::I64 => 1,
            Self::BF16 => 2,
            Self::F32 => 3,
            Self::Complex64 => 4,
            Self::QInt8 | Self::QUInt8 => 0,
        }
    }

    fn max_rank(self, other: Self) -> Self {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        Self::F32
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Tests
// =============================================================================

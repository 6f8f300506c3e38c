//! Data Types - Diffjit Element Type System
//!
//! Runtime representation of tensor element types. Storage is always held as
//! `f32`; a dtype decides how values are rounded when they are written, so a
//! half-precision tensor carries exactly the values an `f16` buffer would.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

// =============================================================================
// DType Enum
// =============================================================================

/// Runtime representation of tensor data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 16-bit floating point (half precision).
    F16,
    /// 16-bit brain floating point.
    BF16,
    /// 32-bit floating point (single precision).
    F32,
    /// 64-bit floating point (double precision).
    F64,
    /// 64-bit signed integer.
    I64,
    /// Boolean type.
    Bool,
}

impl DType {
    /// Returns the size in bytes of this data type.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// Returns true if this is a floating point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Returns true for the 16-bit float types that low-precision GEMM targets.
    #[must_use]
    pub const fn is_low_precision(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Returns the name of this data type as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }

    /// Rounds a value to what this dtype can represent.
    #[must_use]
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::F16 => f16::from_f32(value).to_f32(),
            Self::BF16 => bf16::from_f32(value).to_f32(),
            Self::F32 | Self::F64 => value,
            Self::I64 => value.trunc(),
            Self::Bool => {
                if value == 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    /// Rounds every value of a buffer in place.
    pub fn round_slice(self, values: &mut [f32]) {
        if matches!(self, Self::F32 | Self::F64) {
            return;
        }
        for v in values.iter_mut() {
            *v = self.round(*v);
        }
    }

    /// Machine epsilon of the type, used for tolerance checks.
    #[must_use]
    pub fn epsilon(self) -> f32 {
        match self {
            Self::F16 => f16::EPSILON.to_f32(),
            Self::BF16 => bf16::EPSILON.to_f32(),
            Self::F32 | Self::F64 => f32::EPSILON,
            Self::I64 | Self::Bool => 0.0,
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
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_of(), 2);
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::I64.size_of(), 8);
        assert_eq!(DType::Bool.size_of(), 1);
    }

    #[test]
    fn test_dtype_properties() {
        assert!(DType::BF16.is_float());
        assert!(DType::F16.is_low_precision());
        assert!(!DType::F32.is_low_precision());
        assert!(!DType::I64.is_float());
    }

    #[test]
    fn test_round_half() {
        let v = 0.1_f32;
        let r = DType::F16.round(v);
        assert!((r - v).abs() < 1e-3);
        assert_ne!(r, v);
        assert_eq!(DType::F32.round(v), v);
    }

    #[test]
    fn test_round_int_and_bool() {
        assert_eq!(DType::I64.round(2.7), 2.0);
        assert_eq!(DType::Bool.round(-3.0), 1.0);
        assert_eq!(DType::Bool.round(0.0), 0.0);
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(DType::BF16.to_string(), "bf16");
        assert_eq!(DType::default(), DType::F32);
    }
}

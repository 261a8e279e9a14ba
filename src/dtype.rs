//! Data type definitions and the runtime scalar value.

use std::fmt;

/// Numerical data type for array contents.
///
/// These are the primitive types the ALU expression language operates on.
/// `Float16` values are stored as f32 host-side and narrowed only at the
/// device boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    /// Boolean (stored as 1-byte value on the host)
    Bool,
    /// 32-bit signed integer
    Int32,
    /// 32-bit unsigned integer
    Uint32,
    /// 16-bit floating point
    Float16,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
}

impl DType {
    /// Returns the host-layout byte width of this dtype.
    ///
    /// `Float16` is 4 because values are kept as f32 until they cross a
    /// device boundary.
    #[inline]
    pub const fn byte_width(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::Int32 | DType::Uint32 | DType::Float16 | DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    /// Returns true if this is a floating-point dtype.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64)
    }

    /// Returns true if this is an integer dtype.
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, DType::Int32 | DType::Uint32)
    }

    /// Promotes two dtypes along the lattice
    /// `bool -> uint32 -> int32 -> float16 -> float32 -> float64`.
    ///
    /// This is deliberately a small lattice; the full NumPy promotion table
    /// is out of scope.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::DType;
    /// assert_eq!(DType::promote(DType::Bool, DType::Int32), DType::Int32);
    /// assert_eq!(DType::promote(DType::Int32, DType::Float16), DType::Float16);
    /// ```
    pub fn promote(dtype1: DType, dtype2: DType) -> DType {
        let rank = |d: DType| match d {
            DType::Bool => 0,
            DType::Uint32 => 1,
            DType::Int32 => 2,
            DType::Float16 => 3,
            DType::Float32 => 4,
            DType::Float64 => 5,
        };
        if rank(dtype1) >= rank(dtype2) {
            dtype1
        } else {
            dtype2
        }
    }

    /// Parse a string into a DType.
    pub fn parse(s: &str) -> Option<DType> {
        match s.to_lowercase().as_str() {
            "bool" => Some(DType::Bool),
            "int32" | "i32" => Some(DType::Int32),
            "uint32" | "u32" => Some(DType::Uint32),
            "float16" | "f16" => Some(DType::Float16),
            "float32" | "f32" => Some(DType::Float32),
            "float64" | "f64" => Some(DType::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Bool => write!(f, "bool"),
            DType::Int32 => write!(f, "int32"),
            DType::Uint32 => write!(f, "uint32"),
            DType::Float16 => write!(f, "float16"),
            DType::Float32 => write!(f, "float32"),
            DType::Float64 => write!(f, "float64"),
        }
    }
}

/// A single runtime value, tagged by representation.
///
/// `Float16` values ride in the `F32` variant; the dtype tag on the
/// surrounding expression distinguishes them.
#[derive(Debug, Copy, Clone)]
pub enum Scalar {
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer value
    I32(i32),
    /// 32-bit unsigned integer value
    U32(u32),
    /// 32-bit float value (also carries float16)
    F32(f32),
    /// 64-bit float value
    F64(f64),
}

impl Scalar {
    /// The zero value of a dtype.
    pub fn zero(dtype: DType) -> Scalar {
        match dtype {
            DType::Bool => Scalar::Bool(false),
            DType::Int32 => Scalar::I32(0),
            DType::Uint32 => Scalar::U32(0),
            DType::Float16 | DType::Float32 => Scalar::F32(0.0),
            DType::Float64 => Scalar::F64(0.0),
        }
    }

    /// The one value of a dtype.
    pub fn one(dtype: DType) -> Scalar {
        match dtype {
            DType::Bool => Scalar::Bool(true),
            DType::Int32 => Scalar::I32(1),
            DType::Uint32 => Scalar::U32(1),
            DType::Float16 | DType::Float32 => Scalar::F32(1.0),
            DType::Float64 => Scalar::F64(1.0),
        }
    }

    /// The dtype whose representation this value carries.
    ///
    /// `F32` reports `Float32`; a surrounding `Float16` tag is preserved by
    /// the expression node, not the scalar.
    pub fn dtype(self) -> DType {
        match self {
            Scalar::Bool(_) => DType::Bool,
            Scalar::I32(_) => DType::Int32,
            Scalar::U32(_) => DType::Uint32,
            Scalar::F32(_) => DType::Float32,
            Scalar::F64(_) => DType::Float64,
        }
    }

    /// Convert to f64, the widest common representation.
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as u8 as f64,
            Scalar::I32(v) => v as f64,
            Scalar::U32(v) => v as f64,
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
        }
    }

    /// Convert to i64 with float truncation.
    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::I32(v) => v as i64,
            Scalar::U32(v) => v as i64,
            Scalar::F32(v) => v as i64,
            Scalar::F64(v) => v as i64,
        }
    }

    /// Truthiness, used by `where` conditions.
    pub fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::I32(v) => v != 0,
            Scalar::U32(v) => v != 0,
            Scalar::F32(v) => v != 0.0,
            Scalar::F64(v) => v != 0.0,
        }
    }

    /// Cast a value to a target dtype, following IEEE/two's-complement
    /// conversion semantics.
    pub fn cast(self, dtype: DType) -> Scalar {
        match dtype {
            DType::Bool => Scalar::Bool(self.as_bool()),
            DType::Int32 => Scalar::I32(match self {
                Scalar::Bool(b) => b as i32,
                Scalar::I32(v) => v,
                Scalar::U32(v) => v as i32,
                Scalar::F32(v) => v as i32,
                Scalar::F64(v) => v as i32,
            }),
            DType::Uint32 => Scalar::U32(match self {
                Scalar::Bool(b) => b as u32,
                Scalar::I32(v) => v as u32,
                Scalar::U32(v) => v,
                Scalar::F32(v) => v as u32,
                Scalar::F64(v) => v as u32,
            }),
            DType::Float16 => {
                // Round-trip through f16 to get the narrowed precision.
                let h = half::f16::from_f64(self.as_f64());
                Scalar::F32(h.to_f32())
            }
            DType::Float32 => Scalar::F32(self.as_f64() as f32),
            DType::Float64 => Scalar::F64(self.as_f64()),
        }
    }

    /// Bit pattern for hashing: structural equality must treat equal
    /// constants as equal, including NaN with itself.
    pub(crate) fn bits(self) -> u64 {
        match self {
            Scalar::Bool(b) => b as u64,
            Scalar::I32(v) => 0x1_0000_0000 ^ (v as u32 as u64),
            Scalar::U32(v) => 0x2_0000_0000 ^ (v as u64),
            Scalar::F32(v) => 0x3_0000_0000 ^ (v.to_bits() as u64),
            Scalar::F64(v) => 0x4_0000_0000 ^ v.to_bits(),
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for Scalar {}

impl std::hash::Hash for Scalar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_width() {
        assert_eq!(DType::Bool.byte_width(), 1);
        assert_eq!(DType::Int32.byte_width(), 4);
        assert_eq!(DType::Uint32.byte_width(), 4);
        assert_eq!(DType::Float16.byte_width(), 4);
        assert_eq!(DType::Float32.byte_width(), 4);
        assert_eq!(DType::Float64.byte_width(), 8);
    }

    #[test]
    fn test_promotion() {
        assert_eq!(DType::promote(DType::Bool, DType::Uint32), DType::Uint32);
        assert_eq!(DType::promote(DType::Uint32, DType::Int32), DType::Int32);
        assert_eq!(DType::promote(DType::Int32, DType::Float16), DType::Float16);
        assert_eq!(DType::promote(DType::Float32, DType::Float64), DType::Float64);
        assert_eq!(DType::promote(DType::Float32, DType::Float32), DType::Float32);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(DType::parse("float32"), Some(DType::Float32));
        assert_eq!(DType::parse("f32"), Some(DType::Float32));
        assert_eq!(DType::parse("bool"), Some(DType::Bool));
        assert_eq!(DType::parse("unknown"), None);
        assert_eq!(DType::Float64.to_string(), "float64");
        assert_eq!(DType::Uint32.to_string(), "uint32");
    }

    #[test]
    fn test_scalar_cast() {
        assert_eq!(Scalar::F32(2.7).cast(DType::Int32), Scalar::I32(2));
        assert_eq!(Scalar::F32(-1.5).cast(DType::Int32), Scalar::I32(-1));
        assert_eq!(Scalar::I32(0).cast(DType::Bool), Scalar::Bool(false));
        assert_eq!(Scalar::I32(42).cast(DType::Bool), Scalar::Bool(true));
        assert_eq!(Scalar::F64(1.0).cast(DType::Float32), Scalar::F32(1.0));
    }

    #[test]
    fn test_scalar_f16_narrowing() {
        // 1/3 is not representable in f16; the cast must lose precision.
        let narrowed = Scalar::F32(1.0 / 3.0).cast(DType::Float16);
        if let Scalar::F32(v) = narrowed {
            assert!((v - 1.0 / 3.0).abs() > 0.0);
            assert!((v - 1.0 / 3.0).abs() < 1e-3);
        } else {
            panic!("expected F32 storage for f16");
        }
    }

    #[test]
    fn test_scalar_nan_equality() {
        // Structural equality is bitwise: NaN == NaN for hash-consing.
        assert_eq!(Scalar::F32(f32::NAN), Scalar::F32(f32::NAN));
        assert_ne!(Scalar::F32(0.0), Scalar::F32(-0.0));
    }

    #[test]
    fn test_identity_values() {
        assert_eq!(Scalar::zero(DType::Float32), Scalar::F32(0.0));
        assert_eq!(Scalar::one(DType::Int32), Scalar::I32(1));
        assert_eq!(Scalar::one(DType::Bool), Scalar::Bool(true));
    }
}

//! Kernel: a single-output fused computation with an optional reduction.

use crate::alu::AluExp;
use crate::dtype::{DType, Scalar};
use std::hash::{Hash, Hasher};

/// Combining operation of a reduction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum
    Add,
    /// Product
    Mul,
    /// Minimum
    Min,
    /// Maximum
    Max,
}

impl ReduceOp {
    /// The identity element for this op at a given dtype.
    ///
    /// Reductions over empty axes yield exactly this value.
    pub fn identity(self, dtype: DType) -> Scalar {
        match self {
            ReduceOp::Add => Scalar::zero(dtype),
            ReduceOp::Mul => Scalar::one(dtype),
            ReduceOp::Min => match dtype {
                DType::Bool => Scalar::Bool(true),
                DType::Int32 => Scalar::I32(i32::MAX),
                DType::Uint32 => Scalar::U32(u32::MAX),
                DType::Float16 | DType::Float32 => Scalar::F32(f32::INFINITY),
                DType::Float64 => Scalar::F64(f64::INFINITY),
            },
            ReduceOp::Max => match dtype {
                DType::Bool => Scalar::Bool(false),
                DType::Int32 => Scalar::I32(i32::MIN),
                DType::Uint32 => Scalar::U32(0),
                DType::Float16 | DType::Float32 => Scalar::F32(f32::NEG_INFINITY),
                DType::Float64 => Scalar::F64(f64::NEG_INFINITY),
            },
        }
    }

    /// Fold one element into the accumulator as an expression.
    pub fn combine(self, acc: &AluExp, value: &AluExp) -> AluExp {
        match self {
            ReduceOp::Add => acc.add(value),
            ReduceOp::Mul => acc.mul(value),
            ReduceOp::Min => acc.min(value),
            ReduceOp::Max => acc.max(value),
        }
    }
}

/// Reduction descriptor attached to a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    /// Combining operation
    pub op: ReduceOp,
    /// Number of elements folded per output
    pub size: usize,
    /// Optional fused epilogue over the `acc` special, applied once per
    /// output after the loop (e.g. the `1/n` scale of `mean`)
    pub fusion: Option<AluExp>,
}

/// A fused, single-output computation.
///
/// `exp` produces one scalar per output index; it may read the `gidx`
/// special and, if `reduction` is present, the `ridx` special in
/// `0..reduction.size`.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    /// Number of distinct input buffers the expression reads
    pub num_inputs: usize,
    /// Output element count
    pub size: usize,
    /// Per-output-index expression
    pub exp: AluExp,
    /// Optional reduction descriptor
    pub reduction: Option<Reduction>,
}

impl Kernel {
    /// Output dtype (the epilogue's if present, else the body's).
    pub fn dtype(&self) -> DType {
        match &self.reduction {
            Some(r) => r.fusion.as_ref().map(|f| f.dtype()).unwrap_or_else(|| self.exp.dtype()),
            None => self.exp.dtype(),
        }
    }

    /// Stable content hash, used as the executable-cache key.
    pub fn cache_key(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.num_inputs.hash(&mut hasher);
        self.size.hash(&mut hasher);
        self.exp.hash(&mut hasher);
        if let Some(r) = &self.reduction {
            r.op.hash(&mut hasher);
            r.size.hash(&mut hasher);
            r.fusion.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alu::Special;

    #[test]
    fn test_reduce_identities() {
        assert_eq!(ReduceOp::Add.identity(DType::Float32), Scalar::F32(0.0));
        assert_eq!(ReduceOp::Mul.identity(DType::Int32), Scalar::I32(1));
        assert_eq!(ReduceOp::Min.identity(DType::Int32), Scalar::I32(i32::MAX));
        assert_eq!(ReduceOp::Max.identity(DType::Uint32), Scalar::U32(0));
    }

    #[test]
    fn test_cache_key_stability() {
        let exp = AluExp::special(Special::Gidx, 8).cast(DType::Float32);
        let k1 = Kernel { num_inputs: 0, size: 8, exp: exp.clone(), reduction: None };
        let k2 = Kernel { num_inputs: 0, size: 8, exp, reduction: None };
        assert_eq!(k1.cache_key(), k2.cache_key());

        let k3 = Kernel { num_inputs: 0, size: 16, ..k1.clone() };
        assert_ne!(k1.cache_key(), k3.cache_key());
    }

    #[test]
    fn test_kernel_dtype_follows_epilogue() {
        let exp = AluExp::special(Special::Gidx, 4).cast(DType::Float32);
        let epilogue = AluExp::acc(DType::Float32).mul(&AluExp::f32(0.25));
        let k = Kernel {
            num_inputs: 0,
            size: 1,
            exp,
            reduction: Some(Reduction { op: ReduceOp::Add, size: 4, fusion: Some(epilogue) }),
        };
        assert_eq!(k.dtype(), DType::Float32);
    }
}

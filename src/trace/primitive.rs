//! The primitive catalogue.
//!
//! Every traced operation is one of these. Composite library ops (matmul,
//! concatenate, argmax, mean-of-all, einsum) decompose into this set during
//! tracing, so the transformation rules below cover everything the tracer
//! can record. Each primitive supplies abstract evaluation here, a concrete
//! evaluation (the ops surface), plus jvp / transpose / batch rules in the
//! transformation modules.

use crate::array::Array;
use crate::dtype::DType;
use crate::kernel::ReduceOp;
use crate::routines::RoutineKind;
use crate::trace::jaxpr::Aval;

/// A traced primitive operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Power
    Pow,
    /// Element-wise minimum
    Min,
    /// Element-wise maximum
    Max,
    /// Negation
    Neg,
    /// Absolute value
    Abs,
    /// Exponential
    Exp,
    /// Natural logarithm
    Log,
    /// Sine
    Sin,
    /// Cosine
    Cos,
    /// Tangent
    Tan,
    /// Arctangent
    Atan,
    /// Arcsine
    Asin,
    /// Square root
    Sqrt,
    /// Reciprocal
    Recip,
    /// Error function
    Erf,
    /// Complementary error function
    Erfc,
    /// Equality comparison
    Eq,
    /// Inequality comparison
    Ne,
    /// Less-than comparison
    Lt,
    /// Less-or-equal comparison
    Le,
    /// Greater-than comparison
    Gt,
    /// Greater-or-equal comparison
    Ge,
    /// Ternary select
    Where,
    /// Dtype conversion
    Cast(DType),
    /// Axis reduction
    Reduce {
        /// Combining op
        op: ReduceOp,
        /// Normalized axis
        axis: usize,
        /// Keep the reduced axis as size 1
        keepdims: bool,
    },
    /// Mean along an axis (sum with a fused `1/n` epilogue)
    Mean {
        /// Normalized axis
        axis: usize,
        /// Keep the reduced axis as size 1
        keepdims: bool,
    },
    /// Reshape to the given shape
    Reshape(Vec<usize>),
    /// Axis permutation
    Transpose(Vec<usize>),
    /// Broadcast to the given shape
    Broadcast(Vec<usize>),
    /// Rectangular slice
    Slice {
        /// Start per axis
        starts: Vec<usize>,
        /// Stop per axis
        stops: Vec<usize>,
        /// Step per axis
        steps: Vec<usize>,
    },
    /// Axis reversal mask
    Flip(Vec<bool>),
    /// Zero padding per axis
    Pad(Vec<(usize, usize)>),
    /// Threefry bit generation from a key
    RandomBits {
        /// Number of u32 words
        count: usize,
    },
    /// Non-fusible routine
    Routine(RoutineKind),
}

impl Primitive {
    /// True for element-wise primitives (the fusible set).
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Primitive::Add
                | Primitive::Sub
                | Primitive::Mul
                | Primitive::Div
                | Primitive::Pow
                | Primitive::Min
                | Primitive::Max
                | Primitive::Neg
                | Primitive::Abs
                | Primitive::Exp
                | Primitive::Log
                | Primitive::Sin
                | Primitive::Cos
                | Primitive::Tan
                | Primitive::Atan
                | Primitive::Asin
                | Primitive::Sqrt
                | Primitive::Recip
                | Primitive::Erf
                | Primitive::Erfc
                | Primitive::Eq
                | Primitive::Ne
                | Primitive::Lt
                | Primitive::Le
                | Primitive::Gt
                | Primitive::Ge
                | Primitive::Where
                | Primitive::Cast(_)
        )
    }

    /// Shape/dtype propagation.
    pub fn abstract_eval(&self, inputs: &[Aval]) -> Aval {
        match self {
            Primitive::Eq
            | Primitive::Ne
            | Primitive::Lt
            | Primitive::Le
            | Primitive::Gt
            | Primitive::Ge => Aval { shape: inputs[0].shape.clone(), dtype: DType::Bool },
            Primitive::Cast(dtype) => Aval { shape: inputs[0].shape.clone(), dtype: *dtype },
            Primitive::Where => inputs[1].clone(),
            Primitive::Reduce { axis, keepdims, .. } => {
                reduced_aval(&inputs[0], *axis, *keepdims, inputs[0].dtype)
            }
            Primitive::Mean { axis, keepdims } => {
                reduced_aval(&inputs[0], *axis, *keepdims, inputs[0].dtype)
            }
            Primitive::Reshape(shape) => {
                Aval { shape: shape.clone(), dtype: inputs[0].dtype }
            }
            Primitive::Transpose(perm) => Aval {
                shape: perm.iter().map(|&a| inputs[0].shape[a]).collect(),
                dtype: inputs[0].dtype,
            },
            Primitive::Broadcast(shape) => {
                Aval { shape: shape.clone(), dtype: inputs[0].dtype }
            }
            Primitive::Slice { starts, stops, steps } => Aval {
                shape: starts
                    .iter()
                    .zip(stops)
                    .zip(steps)
                    .map(|((&lo, &hi), &st)| (hi - lo).div_ceil(st))
                    .collect(),
                dtype: inputs[0].dtype,
            },
            Primitive::Flip(_) => inputs[0].clone(),
            Primitive::Pad(widths) => Aval {
                shape: inputs[0]
                    .shape
                    .iter()
                    .zip(widths)
                    .map(|(&d, &(b, a))| d + b + a)
                    .collect(),
                dtype: inputs[0].dtype,
            },
            Primitive::RandomBits { count } => {
                Aval { shape: vec![*count], dtype: DType::Uint32 }
            }
            Primitive::Routine(kind) => routine_aval(kind, inputs),
            // Element-wise: shape and dtype follow the first operand.
            _ => inputs[0].clone(),
        }
    }
}

fn reduced_aval(input: &Aval, axis: usize, keepdims: bool, dtype: DType) -> Aval {
    let mut shape = input.shape.clone();
    if keepdims {
        shape[axis] = 1;
    } else {
        shape.remove(axis);
    }
    Aval { shape, dtype }
}

fn routine_aval(kind: &RoutineKind, inputs: &[Aval]) -> Aval {
    match kind {
        RoutineKind::Sort { .. } => inputs[0].clone(),
        RoutineKind::Argsort { .. } => {
            Aval { shape: inputs[0].shape.clone(), dtype: DType::Int32 }
        }
        RoutineKind::Cholesky => inputs[0].clone(),
        RoutineKind::TriangularSolve { .. } => inputs[1].clone(),
        RoutineKind::Threefry { count } => Aval { shape: vec![*count], dtype: DType::Uint32 },
    }
}

/// Concrete evaluation: dispatch to the ops surface. Replaying through the
/// public ops keeps laziness (and re-records when an outer trace is live,
/// which is what transformation nesting relies on).
pub(crate) fn apply(prim: &Primitive, inputs: &[&Array]) -> Array {
    match prim {
        Primitive::Add => inputs[0].add(inputs[1]),
        Primitive::Sub => inputs[0].sub(inputs[1]),
        Primitive::Mul => inputs[0].mul(inputs[1]),
        Primitive::Div => inputs[0].div(inputs[1]),
        Primitive::Pow => inputs[0].pow(inputs[1]),
        Primitive::Min => inputs[0].minimum(inputs[1]),
        Primitive::Max => inputs[0].maximum(inputs[1]),
        Primitive::Neg => inputs[0].neg(),
        Primitive::Abs => inputs[0].abs(),
        Primitive::Exp => inputs[0].exp(),
        Primitive::Log => inputs[0].log(),
        Primitive::Sin => inputs[0].sin(),
        Primitive::Cos => inputs[0].cos(),
        Primitive::Tan => inputs[0].tan(),
        Primitive::Atan => inputs[0].atan(),
        Primitive::Asin => inputs[0].asin(),
        Primitive::Sqrt => inputs[0].sqrt(),
        Primitive::Recip => inputs[0].reciprocal(),
        Primitive::Erf => inputs[0].erf(),
        Primitive::Erfc => inputs[0].erfc(),
        Primitive::Eq => inputs[0].eq(inputs[1]),
        Primitive::Ne => inputs[0].ne(inputs[1]),
        Primitive::Lt => inputs[0].lt(inputs[1]),
        Primitive::Le => inputs[0].le(inputs[1]),
        Primitive::Gt => inputs[0].gt(inputs[1]),
        Primitive::Ge => inputs[0].ge(inputs[1]),
        Primitive::Where => Array::where_(inputs[0], inputs[1], inputs[2]),
        Primitive::Cast(dtype) => inputs[0].astype(*dtype),
        Primitive::Reduce { op, axis, keepdims } => {
            inputs[0].reduce_axis(*op, *axis, *keepdims)
        }
        Primitive::Mean { axis, keepdims } => {
            inputs[0].mean(Some(*axis as isize), *keepdims)
        }
        Primitive::Reshape(shape) => {
            let signed: Vec<isize> = shape.iter().map(|&d| d as isize).collect();
            inputs[0].reshape(&signed)
        }
        Primitive::Transpose(perm) => inputs[0].transpose(Some(perm)),
        Primitive::Broadcast(shape) => inputs[0].broadcast_to(shape),
        Primitive::Slice { starts, stops, steps } => {
            inputs[0].slice(starts, stops, Some(steps))
        }
        Primitive::Flip(mask) => {
            let axes: Vec<isize> = mask
                .iter()
                .enumerate()
                .filter(|(_, &f)| f)
                .map(|(a, _)| a as isize)
                .collect();
            inputs[0].flip(&axes)
        }
        Primitive::Pad(widths) => inputs[0].pad(widths),
        Primitive::RandomBits { count } => crate::random::random_bits(inputs[0], *count),
        Primitive::Routine(kind) => crate::routines::apply_routine(kind, inputs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abstract_eval_elementwise() {
        let aval = Aval { shape: vec![2, 3], dtype: DType::Float32 };
        let out = Primitive::Add.abstract_eval(&[aval.clone(), aval.clone()]);
        assert_eq!(out, aval);
        let cmp = Primitive::Lt.abstract_eval(&[aval.clone(), aval]);
        assert_eq!(cmp.dtype, DType::Bool);
    }

    #[test]
    fn test_abstract_eval_reduce() {
        let aval = Aval { shape: vec![2, 3], dtype: DType::Float32 };
        let out = Primitive::Reduce { op: ReduceOp::Add, axis: 1, keepdims: false }
            .abstract_eval(&[aval.clone()]);
        assert_eq!(out.shape, vec![2]);
        let kept = Primitive::Reduce { op: ReduceOp::Add, axis: 1, keepdims: true }
            .abstract_eval(&[aval]);
        assert_eq!(kept.shape, vec![2, 1]);
    }

    #[test]
    fn test_abstract_eval_matches_concrete() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        for prim in [
            Primitive::Neg,
            Primitive::Reshape(vec![3, 2]),
            Primitive::Transpose(vec![1, 0]),
            Primitive::Pad(vec![(1, 0), (0, 1)]),
            Primitive::Reduce { op: ReduceOp::Max, axis: 0, keepdims: false },
        ] {
            let concrete = apply(&prim, &[&a]);
            let abstracted = prim.abstract_eval(&[Aval::of(&a)]);
            assert_eq!(concrete.shape(), &abstracted.shape[..], "{:?}", prim);
            assert_eq!(concrete.dtype(), abstracted.dtype, "{:?}", prim);
        }
    }
}

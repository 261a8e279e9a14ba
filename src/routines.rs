//! Routines: named operations that resist fusion.
//!
//! A routine has typed inputs and outputs and is opaque to the fuser; the
//! scheduler realizes its arguments before invoking it. The CPU reference
//! implementations below define the semantics; every backend runs the same
//! host code (device buffers round-trip through `read`/`malloc`), so
//! results are bit-identical across backends.

use crate::array::Array;
use crate::backend::wasm::softmath;
use crate::backend::{read_scalar, write_scalar};
use crate::buffer::BufferHandle;
use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::trace::{record, Primitive};

/// The routine catalogue.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutineKind {
    /// Ascending stable sort along an axis
    Sort {
        /// Axis to sort along
        axis: usize,
    },
    /// Indices of the ascending stable sort along an axis
    Argsort {
        /// Axis to sort along
        axis: usize,
    },
    /// Cholesky decomposition (lower factor, Banachiewicz order)
    Cholesky,
    /// Triangular solve by substitution
    TriangularSolve {
        /// Whether `a` is lower triangular
        lower: bool,
        /// Treat the diagonal as ones
        unit_diagonal: bool,
    },
    /// Threefry-2x32 bit generation: key -> `count` u32 words
    Threefry {
        /// Number of 32-bit words to produce
        count: usize,
    },
}

/// A routine invocation: kind plus typed I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    /// Which operation
    pub kind: RoutineKind,
    /// Input (shape, dtype) pairs
    pub in_avals: Vec<(Vec<usize>, DType)>,
    /// Output (shape, dtype) pairs
    pub out_avals: Vec<(Vec<usize>, DType)>,
}

impl Routine {
    /// Stable display name.
    pub fn name(&self) -> &'static str {
        match self.kind {
            RoutineKind::Sort { .. } => "sort",
            RoutineKind::Argsort { .. } => "argsort",
            RoutineKind::Cholesky => "cholesky",
            RoutineKind::TriangularSolve { .. } => "solve_triangular",
            RoutineKind::Threefry { .. } => "threefry",
        }
    }
}

/// Sort keys with a total order: floats by IEEE total ordering (NaN last
/// among positives), ints numerically.
fn sort_key(v: Scalar) -> u64 {
    match v {
        Scalar::F32(f) => {
            let bits = (f as f64).to_bits();
            // Flip ordering bits so the integer compare matches total_cmp.
            if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) }
        }
        Scalar::F64(f) => {
            let bits = f.to_bits();
            if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) }
        }
        Scalar::I32(i) => (i as i64 as u64) ^ (1 << 63),
        Scalar::U32(u) => u as u64,
        Scalar::Bool(b) => b as u64,
    }
}

/// Execute a routine on host-layout byte buffers.
///
/// Returns `(bytes, dtype, len)` per output.
pub(crate) fn execute_host(
    routine: &Routine,
    inputs: &[Vec<u8>],
) -> Result<Vec<(Vec<u8>, DType, usize)>> {
    match &routine.kind {
        RoutineKind::Sort { axis } => {
            let (shape, dtype) = &routine.in_avals[0];
            let out = sorted_lanes(&inputs[0], shape, *dtype, *axis, |lane| {
                lane.iter().map(|&(_, v)| v).collect()
            });
            let len = shape.iter().product();
            Ok(vec![(encode(&out, *dtype), *dtype, len)])
        }
        RoutineKind::Argsort { axis } => {
            let (shape, dtype) = &routine.in_avals[0];
            let out = sorted_lanes(&inputs[0], shape, *dtype, *axis, |lane| {
                lane.iter().map(|&(i, _)| Scalar::I32(i as i32)).collect()
            });
            let len = shape.iter().product();
            Ok(vec![(encode(&out, DType::Int32), DType::Int32, len)])
        }
        RoutineKind::Cholesky => {
            let (shape, dtype) = &routine.in_avals[0];
            let n = shape[0];
            let a = decode_f64(&inputs[0], *dtype);
            let mut l = vec![0.0f64; n * n];
            for i in 0..n {
                for j in 0..=i {
                    let mut sum = a[i * n + j];
                    for k in 0..j {
                        sum -= l[i * n + k] * l[j * n + k];
                    }
                    if i == j {
                        l[i * n + j] = sum.sqrt();
                    } else {
                        l[i * n + j] = sum / l[j * n + j];
                    }
                }
            }
            Ok(vec![(encode_f64(&l, *dtype), *dtype, n * n)])
        }
        RoutineKind::TriangularSolve { lower, unit_diagonal } => {
            let (a_shape, a_dtype) = &routine.in_avals[0];
            let (b_shape, _) = &routine.in_avals[1];
            let n = a_shape[0];
            let m = if b_shape.len() == 2 { b_shape[1] } else { 1 };
            let a = decode_f64(&inputs[0], *a_dtype);
            let b = decode_f64(&inputs[1], *a_dtype);
            let mut x = b.clone();
            for col in 0..m {
                if *lower {
                    for i in 0..n {
                        let mut sum = x[i * m + col];
                        for k in 0..i {
                            sum -= a[i * n + k] * x[k * m + col];
                        }
                        x[i * m + col] =
                            if *unit_diagonal { sum } else { sum / a[i * n + i] };
                    }
                } else {
                    for i in (0..n).rev() {
                        let mut sum = x[i * m + col];
                        for k in i + 1..n {
                            sum -= a[i * n + k] * x[k * m + col];
                        }
                        x[i * m + col] =
                            if *unit_diagonal { sum } else { sum / a[i * n + i] };
                    }
                }
            }
            Ok(vec![(encode_f64(&x, *a_dtype), *a_dtype, n * m)])
        }
        RoutineKind::Threefry { count } => {
            let key_bytes = &inputs[0];
            if key_bytes.len() != 8 {
                return Err(Error::Routine {
                    name: "threefry",
                    message: format!("key must be two u32 words, got {} bytes", key_bytes.len()),
                });
            }
            let key = [
                u32::from_le_bytes(key_bytes[0..4].try_into().unwrap()),
                u32::from_le_bytes(key_bytes[4..8].try_into().unwrap()),
            ];
            let mut out = Vec::with_capacity(count + 1);
            let mut ctr = 0u32;
            while out.len() < *count {
                let pair = softmath::threefry2x32(key, [ctr, ctr.wrapping_add(1)]);
                out.push(pair[0]);
                out.push(pair[1]);
                ctr = ctr.wrapping_add(2);
            }
            out.truncate(*count);
            let bytes: Vec<u8> = out.iter().flat_map(|w| w.to_le_bytes()).collect();
            Ok(vec![(bytes, DType::Uint32, *count)])
        }
    }
}

/// Output avals of a routine, given concrete inputs.
fn out_avals(kind: &RoutineKind, inputs: &[&Array]) -> Vec<(Vec<usize>, DType)> {
    match kind {
        RoutineKind::Sort { .. } => vec![(inputs[0].shape().to_vec(), inputs[0].dtype())],
        RoutineKind::Argsort { .. } => vec![(inputs[0].shape().to_vec(), DType::Int32)],
        RoutineKind::Cholesky => vec![(inputs[0].shape().to_vec(), inputs[0].dtype())],
        RoutineKind::TriangularSolve { .. } => {
            vec![(inputs[1].shape().to_vec(), inputs[1].dtype())]
        }
        RoutineKind::Threefry { count } => vec![(vec![*count], DType::Uint32)],
    }
}

/// Invoke a routine: realize the inputs, run it on the array's backend, and
/// wrap the outputs. Records the application for the tracer.
///
/// Routines are opaque to fusion; their state machine is created →
/// prepared → dispatched here, observable after the next read.
pub(crate) fn apply_routine(kind: &RoutineKind, inputs: &[&Array]) -> Array {
    let out = run_routine_arrays(kind, inputs);
    record(Primitive::Routine(kind.clone()), inputs, &out);
    out
}

/// Threefry bit generation without a `Routine` trace record; the caller
/// records its own primitive.
pub(crate) fn apply_threefry(key: &Array, count: usize) -> Array {
    run_routine_arrays(&RoutineKind::Threefry { count }, &[key])
}

fn run_routine_arrays(kind: &RoutineKind, inputs: &[&Array]) -> Array {
    let realized: Vec<Array> = inputs
        .iter()
        .map(|a| a.submitted().expect("routine input realization failed"))
        .collect();
    let routine = Routine {
        kind: kind.clone(),
        in_avals: realized.iter().map(|a| (a.shape().to_vec(), a.dtype())).collect(),
        out_avals: out_avals(kind, inputs),
    };
    let device = realized.first().map(|a| a.device()).unwrap_or_else(crate::backend::default_device);
    let backend = crate::backend::backend(Some(device)).expect("backend unavailable");
    let ids: Vec<_> = realized
        .iter()
        .map(|a| a.buffer().expect("submitted arrays are buffer-backed").id())
        .collect();
    log::trace!("routine `{}` on {}", routine.name(), device);
    let outs = backend
        .run_routine(&routine, &ids)
        .unwrap_or_else(|e| panic!("routine `{}` failed: {}", routine.name(), e));
    let (shape, dtype) = routine.out_avals[0].clone();
    let len: usize = shape.iter().product();
    let handle = BufferHandle::adopt(backend, outs[0], dtype, len);
    Array::from_buffer_parts(handle, &shape, Vec::new())
}

impl Array {
    /// Ascending stable sort along `axis`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let a = Array::from_vec(vec![3.0, 1.0, 2.0], &[3]);
    /// assert_eq!(a.sort(-1).to_vec(), vec![1.0, 2.0, 3.0]);
    /// ```
    pub fn sort(&self, axis: isize) -> Array {
        assert!(self.ndim() > 0, "cannot sort a scalar");
        let axis = self.shape_obj().axis(axis);
        apply_routine(&RoutineKind::Sort { axis }, &[self])
    }

    /// Indices that would stably sort along `axis`.
    pub fn argsort(&self, axis: isize) -> Array {
        assert!(self.ndim() > 0, "cannot argsort a scalar");
        let axis = self.shape_obj().axis(axis);
        apply_routine(&RoutineKind::Argsort { axis }, &[self])
    }
}

/// Cholesky decomposition of a symmetric positive-definite matrix, lower
/// factor.
///
/// Non-positive-definite inputs produce NaNs per IEEE-754 (no error).
pub fn cholesky(a: &Array) -> Array {
    assert_eq!(a.ndim(), 2, "cholesky expects a matrix");
    assert_eq!(a.shape()[0], a.shape()[1], "cholesky expects a square matrix");
    assert!(a.dtype().is_float(), "cholesky expects a float matrix");
    apply_routine(&RoutineKind::Cholesky, &[a])
}

/// Solve `a x = b` for triangular `a` by substitution.
pub fn solve_triangular(a: &Array, b: &Array, lower: bool, unit_diagonal: bool) -> Array {
    assert_eq!(a.ndim(), 2, "solve_triangular expects a matrix");
    assert_eq!(a.shape()[0], a.shape()[1], "solve_triangular expects a square matrix");
    assert!(
        b.ndim() == 1 || b.ndim() == 2,
        "solve_triangular expects a vector or matrix right-hand side"
    );
    assert_eq!(a.shape()[1], b.shape()[0], "solve_triangular dimension mismatch");
    assert_eq!(a.dtype(), b.dtype(), "solve_triangular dtype mismatch");
    apply_routine(&RoutineKind::TriangularSolve { lower, unit_diagonal }, &[a, b])
}

/// Apply a per-lane transform of `(original index, value)` pairs, sorted
/// stably ascending, along `axis`.
fn sorted_lanes(
    bytes: &[u8],
    shape: &[usize],
    dtype: DType,
    axis: usize,
    f: impl Fn(&[(usize, Scalar)]) -> Vec<Scalar>,
) -> Vec<Scalar> {
    let n = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let outer: usize = shape[..axis].iter().product();
    let size: usize = shape.iter().product();
    let mut out = vec![Scalar::zero(dtype); size];
    for o in 0..outer {
        for i in 0..inner {
            let mut lane: Vec<(usize, Scalar)> = (0..n)
                .map(|k| {
                    let flat = (o * n + k) * inner + i;
                    (k, read_scalar(bytes, dtype, flat as i64))
                })
                .collect();
            lane.sort_by_key(|&(_, v)| sort_key(v));
            for (k, v) in f(&lane).into_iter().enumerate() {
                out[(o * n + k) * inner + i] = v;
            }
        }
    }
    out
}

fn decode_f64(bytes: &[u8], dtype: DType) -> Vec<f64> {
    let len = bytes.len() / dtype.byte_width();
    (0..len).map(|i| read_scalar(bytes, dtype, i as i64).as_f64()).collect()
}

fn encode_f64(values: &[f64], dtype: DType) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * dtype.byte_width()];
    for (i, &v) in values.iter().enumerate() {
        write_scalar(&mut out, dtype, i, Scalar::F64(v).cast(dtype));
    }
    out
}

fn encode(values: &[Scalar], dtype: DType) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * dtype.byte_width()];
    for (i, &v) in values.iter().enumerate() {
        write_scalar(&mut out, dtype, i, v.cast(dtype));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn bytes_f32(bytes: &[u8]) -> Vec<f32> {
        bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn test_sort_rows() {
        let routine = Routine {
            kind: RoutineKind::Sort { axis: 1 },
            in_avals: vec![(vec![2, 3], DType::Float32)],
            out_avals: vec![(vec![2, 3], DType::Float32)],
        };
        let input = f32_bytes(&[3.0, 1.0, 2.0, 0.0, -1.0, 5.0]);
        let out = execute_host(&routine, &[input]).unwrap();
        assert_eq!(bytes_f32(&out[0].0), vec![1.0, 2.0, 3.0, -1.0, 0.0, 5.0]);
    }

    #[test]
    fn test_sort_axis0_strided() {
        let routine = Routine {
            kind: RoutineKind::Sort { axis: 0 },
            in_avals: vec![(vec![3, 2], DType::Float32)],
            out_avals: vec![(vec![3, 2], DType::Float32)],
        };
        let input = f32_bytes(&[5.0, 0.0, 1.0, 4.0, 3.0, 2.0]);
        let out = execute_host(&routine, &[input]).unwrap();
        assert_eq!(bytes_f32(&out[0].0), vec![1.0, 0.0, 3.0, 2.0, 5.0, 4.0]);
    }

    #[test]
    fn test_argsort_is_stable() {
        let routine = Routine {
            kind: RoutineKind::Argsort { axis: 0 },
            in_avals: vec![(vec![4], DType::Float32)],
            out_avals: vec![(vec![4], DType::Int32)],
        };
        let input = f32_bytes(&[2.0, 1.0, 2.0, 1.0]);
        let out = execute_host(&routine, &[input]).unwrap();
        let idx: Vec<i32> =
            out[0].0.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
        // Ties keep original order.
        assert_eq!(idx, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_sort_nan_last() {
        let routine = Routine {
            kind: RoutineKind::Sort { axis: 0 },
            in_avals: vec![(vec![3], DType::Float32)],
            out_avals: vec![(vec![3], DType::Float32)],
        };
        let input = f32_bytes(&[f32::NAN, 1.0, 0.0]);
        let out = execute_host(&routine, &[input]).unwrap();
        let vals = bytes_f32(&out[0].0);
        assert_eq!(&vals[..2], &[0.0, 1.0]);
        assert!(vals[2].is_nan());
    }

    #[test]
    fn test_cholesky_identityish() {
        // A = [[4, 2], [2, 3]] -> L = [[2, 0], [1, sqrt(2)]]
        let routine = Routine {
            kind: RoutineKind::Cholesky,
            in_avals: vec![(vec![2, 2], DType::Float32)],
            out_avals: vec![(vec![2, 2], DType::Float32)],
        };
        let input = f32_bytes(&[4.0, 2.0, 2.0, 3.0]);
        let out = execute_host(&routine, &[input]).unwrap();
        let l = bytes_f32(&out[0].0);
        assert!((l[0] - 2.0).abs() < 1e-6);
        assert_eq!(l[1], 0.0);
        assert!((l[2] - 1.0).abs() < 1e-6);
        assert!((l[3] - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_triangular_solve_lower() {
        // [[2, 0], [1, 1]] x = [[2], [4]] -> x = [[1], [3]]
        let routine = Routine {
            kind: RoutineKind::TriangularSolve { lower: true, unit_diagonal: false },
            in_avals: vec![(vec![2, 2], DType::Float32), (vec![2, 1], DType::Float32)],
            out_avals: vec![(vec![2, 1], DType::Float32)],
        };
        let a = f32_bytes(&[2.0, 0.0, 1.0, 1.0]);
        let b = f32_bytes(&[2.0, 4.0]);
        let out = execute_host(&routine, &[a, b]).unwrap();
        assert_eq!(bytes_f32(&out[0].0), vec![1.0, 3.0]);
    }

    #[test]
    fn test_triangular_solve_upper() {
        // [[1, 1], [0, 2]] x = [3, 4] -> x = [1, 2]
        let routine = Routine {
            kind: RoutineKind::TriangularSolve { lower: false, unit_diagonal: false },
            in_avals: vec![(vec![2, 2], DType::Float32), (vec![2], DType::Float32)],
            out_avals: vec![(vec![2], DType::Float32)],
        };
        let a = f32_bytes(&[1.0, 1.0, 0.0, 2.0]);
        let b = f32_bytes(&[3.0, 4.0]);
        let out = execute_host(&routine, &[a, b]).unwrap();
        assert_eq!(bytes_f32(&out[0].0), vec![1.0, 2.0]);
    }

    #[test]
    fn test_threefry_routine_words() {
        let routine = Routine {
            kind: RoutineKind::Threefry { count: 3 },
            in_avals: vec![(vec![2], DType::Uint32)],
            out_avals: vec![(vec![3], DType::Uint32)],
        };
        let key = [0u8; 8].to_vec();
        let out = execute_host(&routine, &[key]).unwrap();
        let words: Vec<u32> =
            out[0].0.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(words[0], 1_797_259_609);
        assert_eq!(words[1], 2_579_123_966);
        assert_eq!(words.len(), 3);
    }
}

//! Array construction: literals, ranges, and generator expressions.

use crate::alu::{AluExp, Special};
use crate::array::Array;
use crate::buffer::alloc_on;
use crate::dtype::{DType, Scalar};

fn generator(shape: &[usize], exp: AluExp) -> Array {
    let device = crate::backend::default_device();
    Array::from_exp_parts(device, exp.dtype(), shape, exp, Vec::new(), Vec::new())
}

impl Array {
    /// Create an array from a flat `Vec<f32>` and shape.
    ///
    /// # Panics
    ///
    /// Panics if the shape size doesn't match the data length.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
    /// assert_eq!(a.shape(), &[2, 2]);
    /// ```
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        assert_eq!(data.len(), size, "data length must match shape size");
        let buf = alloc_on(None, size, DType::Float32, Some(bytemuck::cast_slice(&data)))
            .expect("allocation failed");
        Array::from_buffer_parts(buf, shape, Vec::new())
    }

    /// Create an array from a flat `Vec<f64>`.
    pub fn from_vec_f64(data: Vec<f64>, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        assert_eq!(data.len(), size, "data length must match shape size");
        let buf = alloc_on(None, size, DType::Float64, Some(bytemuck::cast_slice(&data)))
            .expect("allocation failed");
        Array::from_buffer_parts(buf, shape, Vec::new())
    }

    /// Create an array from a flat `Vec<i32>`.
    pub fn from_vec_i32(data: Vec<i32>, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        assert_eq!(data.len(), size, "data length must match shape size");
        let buf = alloc_on(None, size, DType::Int32, Some(bytemuck::cast_slice(&data)))
            .expect("allocation failed");
        Array::from_buffer_parts(buf, shape, Vec::new())
    }

    /// Create an array from a flat `Vec<u32>`.
    pub fn from_vec_u32(data: Vec<u32>, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        assert_eq!(data.len(), size, "data length must match shape size");
        let buf = alloc_on(None, size, DType::Uint32, Some(bytemuck::cast_slice(&data)))
            .expect("allocation failed");
        Array::from_buffer_parts(buf, shape, Vec::new())
    }

    /// Create an array from a flat `Vec<bool>`.
    pub fn from_vec_bool(data: Vec<bool>, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        assert_eq!(data.len(), size, "data length must match shape size");
        let bytes: Vec<u8> = data.iter().map(|&b| b as u8).collect();
        let buf = alloc_on(None, size, DType::Bool, Some(&bytes)).expect("allocation failed");
        Array::from_buffer_parts(buf, shape, Vec::new())
    }

    /// A scalar array.
    pub fn scalar(value: f64, dtype: DType) -> Array {
        Array::full(value, &[], dtype)
    }

    /// An array filled with zeros. Lazy; no buffer is allocated until
    /// realization.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::{Array, DType};
    /// let a = Array::zeros(&[2, 3], DType::Float32);
    /// assert_eq!(a.to_vec(), vec![0.0; 6]);
    /// ```
    pub fn zeros(shape: &[usize], dtype: DType) -> Array {
        Array::full(0.0, shape, dtype)
    }

    /// An array filled with ones.
    pub fn ones(shape: &[usize], dtype: DType) -> Array {
        Array::full(1.0, shape, dtype)
    }

    /// An array filled with a constant.
    pub fn full(value: f64, shape: &[usize], dtype: DType) -> Array {
        generator(shape, AluExp::constant(dtype, Scalar::F64(value)))
    }

    /// Evenly spaced values in `[start, stop)` with the given step.
    ///
    /// With `stop == None`, counts from zero: `arange(n)` semantics.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::{Array, DType};
    /// let a = Array::arange(0.0, Some(8.0), 1.0, DType::Float32);
    /// assert_eq!(a.shape(), &[8]);
    /// ```
    pub fn arange(start: f64, stop: Option<f64>, step: f64, dtype: DType) -> Array {
        assert!(step != 0.0, "arange step must be non-zero");
        let (start, stop) = match stop {
            Some(stop) => (start, stop),
            None => (0.0, start),
        };
        let count = ((stop - start) / step).ceil().max(0.0) as usize;
        let idx = AluExp::special(Special::Gidx, count);
        // Stay in f32 arithmetic unless the target is f64, so the bytecode
        // backend (f32/i32/u32 ALU) can run generator kernels.
        let exp = match dtype {
            DType::Int32 if step == 1.0 => idx.add(&AluExp::i32(start as i32)),
            DType::Float64 => {
                let f = idx.cast(DType::Float64);
                f.mul(&AluExp::constant(DType::Float64, Scalar::F64(step)))
                    .add(&AluExp::constant(DType::Float64, Scalar::F64(start)))
            }
            _ => {
                let f = idx.cast(DType::Float32);
                f.mul(&AluExp::f32(step as f32))
                    .add(&AluExp::f32(start as f32))
                    .cast(dtype)
            }
        };
        generator(&[count], exp.simplify())
    }

    /// `num` evenly spaced values over `[start, stop]` (inclusive).
    pub fn linspace(start: f64, stop: f64, num: usize, dtype: DType) -> Array {
        assert!(num >= 1, "linspace needs at least one sample");
        let step = if num > 1 { (stop - start) / (num - 1) as f64 } else { 0.0 };
        let exp = if dtype == DType::Float64 {
            let idx = AluExp::special(Special::Gidx, num).cast(DType::Float64);
            idx.mul(&AluExp::constant(DType::Float64, Scalar::F64(step)))
                .add(&AluExp::constant(DType::Float64, Scalar::F64(start)))
        } else {
            let idx = AluExp::special(Special::Gidx, num).cast(DType::Float32);
            idx.mul(&AluExp::f32(step as f32)).add(&AluExp::f32(start as f32)).cast(dtype)
        };
        generator(&[num], exp.simplify())
    }

    /// Identity-like matrix with ones on the `k`-th diagonal.
    pub fn eye(n: usize, m: Option<usize>, k: isize, dtype: DType) -> Array {
        let m = m.unwrap_or(n);
        let gidx = AluExp::special(Special::Gidx, n * m);
        let row = gidx.idiv(&AluExp::i32(m as i32));
        let col = gidx.modulo(&AluExp::i32(m as i32));
        let cond = col.cmp_eq(&row.add(&AluExp::i32(k as i32)));
        let exp = AluExp::select(
            &cond,
            &AluExp::constant(dtype, Scalar::F64(1.0)),
            &AluExp::constant(dtype, Scalar::F64(0.0)),
        );
        generator(&[n, m], exp)
    }

    /// Index along `axis` at every position, as Int32. Internal helper for
    /// arg-reductions.
    pub(crate) fn iota_axis(shape: &[usize], axis: usize) -> Array {
        let size: usize = shape.iter().product();
        let inner: usize = shape[axis + 1..].iter().product();
        let gidx = AluExp::special(Special::Gidx, size);
        let exp = gidx
            .idiv(&AluExp::i32(inner.max(1) as i32))
            .modulo(&AluExp::i32(shape[axis] as i32));
        generator(shape, exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_ones_full() {
        assert_eq!(Array::zeros(&[2, 2], DType::Float32).to_vec(), vec![0.0; 4]);
        assert_eq!(Array::ones(&[3], DType::Float32).to_vec(), vec![1.0; 3]);
        assert_eq!(Array::full(2.5, &[2], DType::Float32).to_vec(), vec![2.5, 2.5]);
    }

    #[test]
    fn test_full_int_dtype() {
        let a = Array::full(3.0, &[2], DType::Int32);
        assert_eq!(a.dtype(), DType::Int32);
        assert_eq!(a.to_vec_i32(), vec![3, 3]);
    }

    #[test]
    fn test_arange() {
        let a = Array::arange(0.0, Some(5.0), 1.0, DType::Float32);
        assert_eq!(a.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        let b = Array::arange(5.0, None, 1.0, DType::Int32);
        assert_eq!(b.to_vec_i32(), vec![0, 1, 2, 3, 4]);

        let c = Array::arange(1.0, Some(2.0), 0.25, DType::Float32);
        assert_eq!(c.to_vec(), vec![1.0, 1.25, 1.5, 1.75]);
    }

    #[test]
    fn test_arange_empty() {
        let a = Array::arange(3.0, Some(3.0), 1.0, DType::Float32);
        assert_eq!(a.size(), 0);
    }

    #[test]
    fn test_linspace() {
        let a = Array::linspace(0.0, 1.0, 5, DType::Float32);
        assert_eq!(a.to_vec(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let single = Array::linspace(2.0, 3.0, 1, DType::Float32);
        assert_eq!(single.to_vec(), vec![2.0]);
    }

    #[test]
    fn test_eye() {
        let a = Array::eye(2, None, 0, DType::Float32);
        assert_eq!(a.to_vec(), vec![1.0, 0.0, 0.0, 1.0]);

        let b = Array::eye(2, Some(3), 1, DType::Float32);
        assert_eq!(b.to_vec(), vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_from_vec_typed() {
        let a = Array::from_vec_i32(vec![1, -2, 3], &[3]);
        assert_eq!(a.dtype(), DType::Int32);
        assert_eq!(a.to_vec(), vec![1.0, -2.0, 3.0]);

        let b = Array::from_vec_bool(vec![true, false], &[2]);
        assert_eq!(b.to_bool_vec(), vec![true, false]);

        let c = Array::from_vec_u32(vec![7, 8], &[2]);
        assert_eq!(c.to_vec_u32(), vec![7, 8]);
    }

    #[test]
    fn test_iota_axis() {
        let a = Array::iota_axis(&[2, 3], 1);
        assert_eq!(a.to_vec_i32(), vec![0, 1, 2, 0, 1, 2]);
        let b = Array::iota_axis(&[2, 3], 0);
        assert_eq!(b.to_vec_i32(), vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    #[should_panic(expected = "data length must match")]
    fn test_from_vec_size_mismatch() {
        Array::from_vec(vec![1.0, 2.0], &[3]);
    }

    #[test]
    fn test_display() {
        let a = Array::zeros(&[2, 3], DType::Float32);
        let s = a.to_string();
        assert!(s.contains("float32"));
        assert!(s.contains("(2, 3)"));
    }
}

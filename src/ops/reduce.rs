//! Reductions: sum, prod, min, max, mean, and the arg-reductions.

use crate::alu::AluExp;
use crate::array::Array;
use crate::dtype::DType;
use crate::kernel::ReduceOp;
use crate::trace::{record, Primitive};

impl Array {
    /// Core reduction along one normalized axis.
    pub(crate) fn reduce_axis(&self, op: ReduceOp, axis: usize, keepdims: bool) -> Array {
        assert!(axis < self.ndim(), "reduction axis {} out of bounds", axis);
        // Move the reduced axis last without recording a primitive; the
        // recorded `Reduce` equation captures the whole operation.
        let mut perm: Vec<usize> = (0..self.ndim()).filter(|&a| a != axis).collect();
        perm.push(axis);
        let moved = self.with_tracker(self.tracker().permute(&perm));
        let out_shape: Vec<usize> =
            self.shape().iter().enumerate().filter(|&(d, _)| d != axis).map(|(_, &s)| s).collect();
        let reduced = moved
            .reduce_last_axis(op, &out_shape, None, self.dtype())
            .expect("reduction dispatch failed");
        let out = if keepdims {
            let mut kept: Vec<isize> = self.shape().iter().map(|&d| d as isize).collect();
            kept[axis] = 1;
            reduced.with_tracker(reduced.tracker().reshape(&kept))
        } else {
            reduced
        };
        record(Primitive::Reduce { op, axis, keepdims }, &[self], &out);
        out
    }

    fn reduce(&self, op: ReduceOp, axis: Option<isize>, keepdims: bool) -> Array {
        match axis {
            Some(axis) => self.reduce_axis(op, self.shape_obj().axis(axis), keepdims),
            None => {
                let flat = self.reshape(&[self.size() as isize]);
                let scalar = flat.reduce_axis(op, 0, false);
                if keepdims {
                    scalar.reshape(&vec![1isize; self.ndim()])
                } else {
                    scalar
                }
            }
        }
    }

    /// Sum along an axis, or over everything when `axis` is `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
    /// assert_eq!(a.sum(Some(0), false).to_vec(), vec![4.0, 6.0]);
    /// assert_eq!(a.sum(None, false).to_vec(), vec![10.0]);
    /// ```
    pub fn sum(&self, axis: Option<isize>, keepdims: bool) -> Array {
        self.reduce(ReduceOp::Add, axis, keepdims)
    }

    /// Product along an axis.
    pub fn prod(&self, axis: Option<isize>, keepdims: bool) -> Array {
        self.reduce(ReduceOp::Mul, axis, keepdims)
    }

    /// Minimum along an axis.
    pub fn min(&self, axis: Option<isize>, keepdims: bool) -> Array {
        self.reduce(ReduceOp::Min, axis, keepdims)
    }

    /// Maximum along an axis.
    pub fn max(&self, axis: Option<isize>, keepdims: bool) -> Array {
        self.reduce(ReduceOp::Max, axis, keepdims)
    }

    /// Arithmetic mean along an axis. Integer inputs are promoted to f32.
    ///
    /// The `1/n` scale rides the reduction as a fused epilogue, so this is
    /// still a single kernel.
    pub fn mean(&self, axis: Option<isize>, keepdims: bool) -> Array {
        if !self.dtype().is_float() {
            return self.astype(DType::Float32).mean(axis, keepdims);
        }
        let axis_n = match axis {
            Some(a) => self.shape_obj().axis(a),
            None => {
                let flat = self.reshape(&[self.size() as isize]);
                let scalar = flat.mean(Some(0), false);
                return if keepdims {
                    scalar.reshape(&vec![1isize; self.ndim()])
                } else {
                    scalar
                };
            }
        };
        let n = self.shape()[axis_n];
        let mut perm: Vec<usize> = (0..self.ndim()).filter(|&a| a != axis_n).collect();
        perm.push(axis_n);
        let moved = self.with_tracker(self.tracker().permute(&perm));
        let out_shape: Vec<usize> = self
            .shape()
            .iter()
            .enumerate()
            .filter(|&(d, _)| d != axis_n)
            .map(|(_, &s)| s)
            .collect();
        let scale = 1.0 / (n.max(1) as f64);
        let epilogue = AluExp::acc(self.dtype())
            .mul(&AluExp::constant(self.dtype(), crate::dtype::Scalar::F64(scale)));
        let reduced = moved
            .reduce_last_axis(ReduceOp::Add, &out_shape, Some(epilogue), self.dtype())
            .expect("mean dispatch failed");
        let out = if keepdims {
            let mut kept: Vec<isize> = self.shape().iter().map(|&d| d as isize).collect();
            kept[axis_n] = 1;
            reduced.with_tracker(reduced.tracker().reshape(&kept))
        } else {
            reduced
        };
        record(Primitive::Mean { axis: axis_n, keepdims }, &[self], &out);
        out
    }

    fn arg_reduce(&self, axis: Option<isize>, keepdims: bool, take_max: bool) -> Array {
        let (target, axis_n) = match axis {
            Some(a) => (self.clone(), self.shape_obj().axis(a)),
            None => (self.reshape(&[self.size() as isize]), 0),
        };
        // Two passes: the extreme value, then the first index attaining it.
        let extreme = if take_max {
            target.max(Some(axis_n as isize), true)
        } else {
            target.min(Some(axis_n as isize), true)
        };
        let mask = target.eq(&extreme);
        let idx = Array::iota_axis(target.shape(), axis_n);
        let big = Array::full(i32::MAX as f64, target.shape(), DType::Int32);
        let selected = Array::where_(&mask, &idx, &big);
        let result = selected.min(Some(axis_n as isize), keepdims && axis.is_some());
        match axis {
            Some(_) => result,
            None if keepdims => result.reshape(&vec![1isize; self.ndim()]),
            None => result,
        }
    }

    /// Index of the maximum along an axis (first occurrence).
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let a = Array::from_vec(vec![3.0, 1.0, 4.0, 2.0, 5.0, 0.0], &[2, 3]);
    /// assert_eq!(a.argmax(Some(1), false).to_vec_i32(), vec![2, 1]);
    /// ```
    pub fn argmax(&self, axis: Option<isize>, keepdims: bool) -> Array {
        self.arg_reduce(axis, keepdims, true)
    }

    /// Index of the minimum along an axis (first occurrence).
    pub fn argmin(&self, axis: Option<isize>, keepdims: bool) -> Array {
        self.arg_reduce(axis, keepdims, false)
    }
}

//! Movement operations: zero-cost shape-tracker rewrites.

use crate::array::Array;
use crate::trace::{record, Primitive};

impl Array {
    /// Reshape to a new shape; one dimension may be `-1` and is inferred.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::{Array, DType};
    /// let a = Array::arange(0.0, Some(6.0), 1.0, DType::Float32);
    /// let b = a.reshape(&[2, 3]);
    /// assert_eq!(b.shape(), &[2, 3]);
    /// ```
    pub fn reshape(&self, new_shape: &[isize]) -> Array {
        let out = self.with_tracker(self.tracker().reshape(new_shape));
        record(Primitive::Reshape(out.shape().to_vec()), &[self], &out);
        out
    }

    /// Permute axes. `None` reverses them.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Array {
        let perm: Vec<usize> = match axes {
            Some(p) => p.to_vec(),
            None => (0..self.ndim()).rev().collect(),
        };
        let out = self.with_tracker(self.tracker().permute(&perm));
        record(Primitive::Transpose(perm), &[self], &out);
        out
    }

    /// Move one axis to a new position.
    pub fn moveaxis(&self, src: isize, dst: isize) -> Array {
        let src = self.shape_obj().axis(src);
        let dst = self.shape_obj().axis(dst);
        let mut perm: Vec<usize> = (0..self.ndim()).filter(|&a| a != src).collect();
        perm.insert(dst, src);
        self.transpose(Some(&perm))
    }

    /// Broadcast to a larger shape (size-1 and missing leading dims grow).
    pub fn broadcast_to(&self, target: &[usize]) -> Array {
        assert!(
            target.len() >= self.ndim(),
            "cannot broadcast rank {} to rank {}",
            self.ndim(),
            target.len()
        );
        let mut padded: Vec<isize> = vec![1; target.len() - self.ndim()];
        padded.extend(self.shape().iter().map(|&d| d as isize));
        let tracker = self.tracker().reshape(&padded).expand(target);
        let out = self.with_tracker(tracker);
        record(Primitive::Broadcast(target.to_vec()), &[self], &out);
        out
    }

    /// Slice each dimension as `starts[d]..stops[d]` by `steps[d]`
    /// (defaulting to 1).
    pub fn slice(&self, starts: &[usize], stops: &[usize], steps: Option<&[usize]>) -> Array {
        let ones = vec![1usize; self.ndim()];
        let steps = steps.unwrap_or(&ones);
        let out = self.with_tracker(self.tracker().slice(starts, stops, steps));
        record(
            Primitive::Slice {
                starts: starts.to_vec(),
                stops: stops.to_vec(),
                steps: steps.to_vec(),
            },
            &[self],
            &out,
        );
        out
    }

    /// Reverse the listed axes.
    pub fn flip(&self, axes: &[isize]) -> Array {
        let mut mask = vec![false; self.ndim()];
        for &a in axes {
            mask[self.shape_obj().axis(a)] = true;
        }
        let out = self.with_tracker(self.tracker().flip(&mask));
        record(Primitive::Flip(mask), &[self], &out);
        out
    }

    /// Zero-pad each dimension by `(before, after)`.
    pub fn pad(&self, widths: &[(usize, usize)]) -> Array {
        let out = self.with_tracker(self.tracker().pad(widths));
        record(Primitive::Pad(widths.to_vec()), &[self], &out);
        out
    }

    /// Remove all size-1 dimensions.
    pub fn squeeze(&self) -> Array {
        let dims: Vec<isize> =
            self.shape().iter().filter(|&&d| d != 1).map(|&d| d as isize).collect();
        self.reshape(&dims)
    }

    /// Remove one size-1 dimension.
    ///
    /// # Panics
    ///
    /// Panics if the dimension is not 1.
    pub fn squeeze_axis(&self, axis: isize) -> Array {
        let axis = self.shape_obj().axis(axis);
        assert_eq!(self.shape()[axis], 1, "can only squeeze a size-1 axis");
        let mut dims: Vec<isize> = self.shape().iter().map(|&d| d as isize).collect();
        dims.remove(axis);
        self.reshape(&dims)
    }

    /// Insert a size-1 dimension at `axis`.
    pub fn expand_dims(&self, axis: usize) -> Array {
        assert!(axis <= self.ndim(), "axis {} out of bounds", axis);
        let mut dims: Vec<isize> = self.shape().iter().map(|&d| d as isize).collect();
        dims.insert(axis, 1);
        self.reshape(&dims)
    }

    /// Concatenate arrays along an existing axis.
    ///
    /// Lowered to pads plus a fused sum, so it stays a single kernel for a
    /// modest number of pieces.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let a = Array::from_vec(vec![1.0, 2.0], &[2]);
    /// let b = Array::from_vec(vec![3.0], &[1]);
    /// let c = Array::concatenate(&[&a, &b], 0);
    /// assert_eq!(c.to_vec(), vec![1.0, 2.0, 3.0]);
    /// ```
    pub fn concatenate(arrays: &[&Array], axis: isize) -> Array {
        assert!(!arrays.is_empty(), "concatenate needs at least one array");
        let first = arrays[0];
        let axis = first.shape_obj().axis(axis);
        for a in arrays {
            assert_eq!(a.dtype(), first.dtype(), "concatenate dtype mismatch");
            assert_eq!(a.ndim(), first.ndim(), "concatenate rank mismatch");
            for d in 0..first.ndim() {
                if d != axis {
                    assert_eq!(
                        a.shape()[d],
                        first.shape()[d],
                        "concatenate shapes differ off-axis"
                    );
                }
            }
        }
        let total: usize = arrays.iter().map(|a| a.shape()[axis]).sum();
        let mut offset = 0;
        let mut acc: Option<Array> = None;
        for a in arrays {
            let d = a.shape()[axis];
            let mut widths = vec![(0, 0); a.ndim()];
            widths[axis] = (offset, total - offset - d);
            let padded = a.pad(&widths);
            acc = Some(match acc {
                None => padded,
                Some(prev) => prev.add(&padded),
            });
            offset += d;
        }
        acc.unwrap()
    }

    /// Stack arrays along a new axis.
    pub fn stack(arrays: &[&Array], axis: usize) -> Array {
        let expanded: Vec<Array> = arrays.iter().map(|a| a.expand_dims(axis)).collect();
        let refs: Vec<&Array> = expanded.iter().collect();
        Array::concatenate(&refs, axis as isize)
    }

    /// Repeat the whole array `reps[d]` times along each axis.
    pub fn tile(&self, reps: &[usize]) -> Array {
        assert_eq!(reps.len(), self.ndim(), "tile needs one rep per axis");
        let mut out = self.clone();
        // Insert a broadcast axis before each dim, then fold it in.
        for (axis, &rep) in reps.iter().enumerate() {
            if rep == 1 {
                continue;
            }
            let d = out.shape()[axis];
            let with_unit = out.expand_dims(axis);
            let mut target = with_unit.shape().to_vec();
            target[axis] = rep;
            let expanded = with_unit.broadcast_to(&target);
            let mut merged: Vec<isize> = expanded.shape().iter().map(|&x| x as isize).collect();
            merged.remove(axis);
            merged[axis] = (rep * d) as isize;
            out = expanded.reshape(&merged);
        }
        out
    }

    /// Repeat each element `n` times along `axis`.
    pub fn repeat(&self, n: usize, axis: isize) -> Array {
        let axis = self.shape_obj().axis(axis);
        let d = self.shape()[axis];
        let with_unit = self.expand_dims(axis + 1);
        let mut target = with_unit.shape().to_vec();
        target[axis + 1] = n;
        let expanded = with_unit.broadcast_to(&target);
        let mut merged: Vec<isize> = expanded.shape().iter().map(|&x| x as isize).collect();
        merged.remove(axis + 1);
        merged[axis] = (d * n) as isize;
        expanded.reshape(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_reshape_roundtrip() {
        let a = Array::arange(0.0, Some(12.0), 1.0, DType::Float32);
        let b = a.reshape(&[3, 4]).reshape(&[12]);
        assert_eq!(b.to_vec(), a.to_vec());
    }

    #[test]
    fn test_transpose_roundtrip() {
        let a = Array::arange(0.0, Some(6.0), 1.0, DType::Float32).reshape(&[2, 3]);
        let b = a.transpose(None).transpose(None);
        assert_eq!(b.to_vec(), a.to_vec());
    }

    #[test]
    fn test_reshape_transpose_reshape() {
        // arange(12).reshape(3,4).T.reshape(2,6)
        let a = Array::arange(0.0, Some(12.0), 1.0, DType::Float32)
            .reshape(&[3, 4])
            .transpose(None)
            .reshape(&[2, 6]);
        assert_eq!(
            a.to_vec(),
            vec![0.0, 4.0, 8.0, 1.0, 5.0, 9.0, 2.0, 6.0, 10.0, 3.0, 7.0, 11.0]
        );
    }

    #[test]
    fn test_moveaxis() {
        let a = Array::arange(0.0, Some(24.0), 1.0, DType::Float32).reshape(&[2, 3, 4]);
        let b = a.moveaxis(0, 2);
        assert_eq!(b.shape(), &[3, 4, 2]);
    }

    #[test]
    fn test_broadcast_to() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        let b = a.broadcast_to(&[2, 3]);
        assert_eq!(b.to_vec(), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_slice_and_step() {
        let a = Array::arange(0.0, Some(10.0), 1.0, DType::Float32);
        let b = a.slice(&[2], &[8], None);
        assert_eq!(b.to_vec(), vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let c = a.slice(&[1], &[10], Some(&[3]));
        assert_eq!(c.to_vec(), vec![1.0, 4.0, 7.0]);
    }

    #[test]
    fn test_flip() {
        let a = Array::arange(0.0, Some(6.0), 1.0, DType::Float32).reshape(&[2, 3]);
        let b = a.flip(&[1]);
        assert_eq!(b.to_vec(), vec![2.0, 1.0, 0.0, 5.0, 4.0, 3.0]);
        let c = a.flip(&[-2]);
        assert_eq!(c.to_vec(), vec![3.0, 4.0, 5.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_pad() {
        let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        let b = a.pad(&[(1, 2)]);
        assert_eq!(b.to_vec(), vec![0.0, 1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_squeeze_expand() {
        let a = Array::zeros(&[1, 3, 1], DType::Float32);
        assert_eq!(a.squeeze().shape(), &[3]);
        assert_eq!(a.squeeze_axis(0).shape(), &[3, 1]);
        assert_eq!(a.squeeze().expand_dims(0).shape(), &[1, 3]);
    }

    #[test]
    fn test_concatenate_axis1() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Array::from_vec(vec![5.0, 6.0], &[2, 1]);
        let c = Array::concatenate(&[&a, &b], 1);
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }

    #[test]
    fn test_stack() {
        let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        let b = Array::from_vec(vec![3.0, 4.0], &[2]);
        let c = Array::stack(&[&a, &b], 0);
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_tile_and_repeat() {
        let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        assert_eq!(a.tile(&[3]).to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert_eq!(a.repeat(2, 0).to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_bad_axis_panics() {
        let a = Array::zeros(&[2], DType::Float32);
        a.flip(&[3]);
    }
}

//! Shape tracker: logical tensor views over a contiguous buffer.
//!
//! A tracker is an ordered stack of views; each view maps a logical
//! multi-index to a linear offset (plus a validity mask for padded regions).
//! Movement operations (reshape, permute, expand, flip, slice, pad) are
//! closed over trackers, so they never touch buffer data.

use crate::alu::AluExp;
use crate::Shape;

/// Ceiling division for signed integers with a positive divisor.
fn div_ceil_isize(a: isize, b: isize) -> isize {
    let d = a.div_euclid(b);
    let r = a.rem_euclid(b);
    if r > 0 {
        d + 1
    } else {
        d
    }
}

/// One view: shape, strides, offset, and an optional per-dimension validity
/// mask `[lo, hi)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    /// Logical shape of the view
    pub shape: Vec<usize>,
    /// Per-dimension strides in elements (may be 0 or negative)
    pub strides: Vec<isize>,
    /// Base offset in elements
    pub offset: isize,
    /// Valid index ranges per dimension; reads outside yield the identity
    pub mask: Option<Vec<(isize, isize)>>,
}

impl View {
    /// A contiguous row-major view of `shape`.
    pub fn contiguous(shape: &[usize]) -> View {
        let strides = Shape::new(shape.to_vec()).default_strides();
        View { shape: shape.to_vec(), strides, offset: 0, mask: None }
    }

    /// Number of elements addressed by this view.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    fn is_contiguous(&self) -> bool {
        self.offset == 0
            && self.mask.is_none()
            && self.strides == Shape::new(self.shape.clone()).default_strides()
    }

    /// Build the (offset, valid) pair for symbolic indices into this view.
    fn index_exp(&self, indices: &[AluExp]) -> (AluExp, AluExp) {
        debug_assert_eq!(indices.len(), self.shape.len());
        let mut off = AluExp::i32(self.offset as i32);
        for (idx, &stride) in indices.iter().zip(&self.strides) {
            if stride != 0 {
                off = off.add(&idx.mul(&AluExp::i32(stride as i32)));
            }
        }
        let mut valid = AluExp::bool(true);
        if let Some(mask) = &self.mask {
            // Emit only the non-trivial bounds.
            for (d, (idx, &(lo, hi))) in indices.iter().zip(mask).enumerate() {
                if lo > 0 {
                    valid = AluExp::and(&valid, &idx.cmp_ge(&AluExp::i32(lo as i32)));
                }
                if (hi.max(0) as usize) < self.shape[d] {
                    valid = AluExp::and(&valid, &idx.cmp_lt(&AluExp::i32(hi as i32)));
                }
            }
        }
        (off, valid)
    }

    /// Numeric counterpart of [`View::index_exp`].
    fn locate(&self, indices: &[i64]) -> Option<i64> {
        if let Some(mask) = &self.mask {
            for (&i, &(lo, hi)) in indices.iter().zip(mask) {
                if i < lo as i64 || i >= hi as i64 {
                    return None;
                }
            }
        }
        let mut off = self.offset as i64;
        for (&i, &stride) in indices.iter().zip(&self.strides) {
            off += i * stride as i64;
        }
        Some(off)
    }
}

/// A stack of views; `views.last()` is the logical view the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeTracker {
    views: Vec<View>,
}

impl ShapeTracker {
    /// A tracker with a single contiguous view of `shape`.
    pub fn from_shape(shape: &[usize]) -> ShapeTracker {
        ShapeTracker { views: vec![View::contiguous(shape)] }
    }

    /// The logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.top().shape
    }

    /// The logical rank.
    pub fn ndim(&self) -> usize {
        self.top().shape.len()
    }

    /// Total number of logical elements.
    pub fn size(&self) -> usize {
        self.top().size()
    }

    /// Strides of the top view, used by tuner heuristics.
    pub fn last_strides(&self) -> &[isize] {
        &self.top().strides
    }

    /// A tracker is contiguous iff it is a single unmasked identity view.
    pub fn is_contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].is_contiguous()
    }

    fn top(&self) -> &View {
        self.views.last().expect("tracker has at least one view")
    }

    fn with_top(&self, view: View) -> ShapeTracker {
        let mut views = self.views.clone();
        *views.last_mut().unwrap() = view;
        ShapeTracker { views }
    }

    fn push_view(&self, view: View) -> ShapeTracker {
        let mut views = self.views.clone();
        views.push(view);
        ShapeTracker { views }
    }

    /// Reshape to `new_shape`; one dimension may be `-1` and is inferred.
    ///
    /// When the top view's strides admit it, the view is rewritten in place;
    /// otherwise a fresh contiguous view is pushed and composed at read time.
    ///
    /// # Panics
    ///
    /// Panics if the total sizes differ.
    pub fn reshape(&self, new_shape: &[isize]) -> ShapeTracker {
        let new_shape = infer_shape(new_shape, self.size());
        assert_eq!(
            new_shape.iter().product::<usize>(),
            self.size(),
            "cannot reshape {:?} into {:?}",
            self.shape(),
            new_shape
        );
        let top = self.top();
        if top.shape == new_shape {
            return self.clone();
        }
        if top.mask.is_none() {
            if let Some(strides) = attempt_reshape(&top.shape, &top.strides, &new_shape) {
                return self.with_top(View {
                    shape: new_shape,
                    strides,
                    offset: top.offset,
                    mask: None,
                });
            }
        }
        self.push_view(View::contiguous(&new_shape))
    }

    /// Permute the logical axes.
    ///
    /// # Panics
    ///
    /// Panics if `axes` is not a permutation of `0..ndim`.
    pub fn permute(&self, axes: &[usize]) -> ShapeTracker {
        let top = self.top();
        assert_eq!(axes.len(), top.shape.len(), "permutation rank mismatch");
        let mut seen = vec![false; axes.len()];
        for &a in axes {
            assert!(a < axes.len() && !seen[a], "invalid permutation {:?}", axes);
            seen[a] = true;
        }
        let shape = axes.iter().map(|&a| top.shape[a]).collect();
        let strides = axes.iter().map(|&a| top.strides[a]).collect();
        let mask = top.mask.as_ref().map(|m| axes.iter().map(|&a| m[a]).collect());
        self.with_top(View { shape, strides, offset: top.offset, mask })
    }

    /// Broadcast: dimensions of size 1 may grow to any size with stride 0.
    pub fn expand(&self, new_shape: &[usize]) -> ShapeTracker {
        let top = self.top();
        assert_eq!(new_shape.len(), top.shape.len(), "expand rank mismatch");
        let mut strides = top.strides.clone();
        let mut mask = top.mask.clone();
        for (d, (&old, &new)) in top.shape.iter().zip(new_shape).enumerate() {
            if old == new {
                continue;
            }
            assert_eq!(old, 1, "can only expand dimensions of size 1, got {} -> {}", old, new);
            strides[d] = 0;
            if let Some(m) = &mut mask {
                // An expanded unit dim is valid either everywhere or nowhere.
                m[d] = if m[d] == (0, 1) { (0, new as isize) } else { (0, 0) };
            }
        }
        self.with_top(View { shape: new_shape.to_vec(), strides, offset: top.offset, mask })
    }

    /// Reverse the masked axes.
    pub fn flip(&self, axes: &[bool]) -> ShapeTracker {
        let top = self.top();
        assert_eq!(axes.len(), top.shape.len(), "flip rank mismatch");
        let mut strides = top.strides.clone();
        let mut offset = top.offset;
        let mut mask = top.mask.clone();
        for (d, &f) in axes.iter().enumerate() {
            if !f {
                continue;
            }
            let n = top.shape[d] as isize;
            offset += (n - 1) * strides[d];
            strides[d] = -strides[d];
            if let Some(m) = &mut mask {
                let (lo, hi) = m[d];
                m[d] = (n - hi, n - lo);
            }
        }
        self.with_top(View { shape: top.shape.clone(), strides, offset, mask })
    }

    /// Slice each dimension as `starts[d]..stops[d]` by `steps[d]`.
    ///
    /// # Panics
    ///
    /// Panics on out-of-range bounds or non-positive steps (negative steps
    /// are expressed as flip-then-slice by the caller).
    pub fn slice(&self, starts: &[usize], stops: &[usize], steps: &[usize]) -> ShapeTracker {
        let top = self.top();
        assert_eq!(starts.len(), top.shape.len(), "slice rank mismatch");
        let mut shape = Vec::with_capacity(starts.len());
        let mut strides = Vec::with_capacity(starts.len());
        let mut offset = top.offset;
        let mut mask = top.mask.clone();
        for d in 0..starts.len() {
            let (start, stop, step) = (starts[d], stops[d], steps[d]);
            assert!(step >= 1, "slice step must be positive");
            assert!(
                start <= stop && stop <= top.shape[d],
                "slice [{}, {}) out of bounds for dim {} of size {}",
                start,
                stop,
                d,
                top.shape[d]
            );
            let len = (stop - start).div_ceil(step);
            offset += start as isize * top.strides[d];
            shape.push(len);
            strides.push(top.strides[d] * step as isize);
            if let Some(m) = &mut mask {
                let (lo, hi) = m[d];
                // i' valid iff start + i'*step lies in [lo, hi)
                let lo2 = div_ceil_isize(lo - start as isize, step as isize).max(0);
                let hi2 = div_ceil_isize(hi - start as isize, step as isize).min(len as isize);
                m[d] = (lo2, hi2.max(lo2));
            }
        }
        self.with_top(View { shape, strides, offset, mask })
    }

    /// Zero-pad: `widths[d] = (before, after)`. Reads in the padding are
    /// masked and yield the identity value.
    pub fn pad(&self, widths: &[(usize, usize)]) -> ShapeTracker {
        let top = self.top();
        assert_eq!(widths.len(), top.shape.len(), "pad rank mismatch");
        if widths.iter().all(|&(b, a)| b == 0 && a == 0) {
            return self.clone();
        }
        let mut shape = Vec::with_capacity(widths.len());
        let mut offset = top.offset;
        let mut mask = Vec::with_capacity(widths.len());
        for (d, &(before, after)) in widths.iter().enumerate() {
            let n = top.shape[d];
            shape.push(n + before + after);
            offset -= before as isize * top.strides[d];
            let (lo, hi) = top
                .mask
                .as_ref()
                .map(|m| m[d])
                .unwrap_or((0, n as isize));
            mask.push((lo + before as isize, hi + before as isize));
        }
        self.with_top(View {
            shape,
            strides: top.strides.clone(),
            offset,
            mask: Some(mask),
        })
    }

    /// Stack this tracker's views on top of `other`: the result reads
    /// through `self` first, then `other`.
    pub fn compose(&self, other: &ShapeTracker) -> ShapeTracker {
        let mut views = other.views.clone();
        views.extend(self.views.iter().cloned());
        ShapeTracker { views }
    }

    /// Lower a symbolic multi-index to `(linear offset, valid)`.
    ///
    /// Views compose right to left; `valid` is the conjunction of every
    /// mask predicate on the way down. Both results are integer-typed
    /// (`int32` offset, `bool` validity).
    pub fn to_alu_exp(&self, indices: &[AluExp]) -> (AluExp, AluExp) {
        assert_eq!(indices.len(), self.ndim(), "index rank mismatch");
        let mut idxs = indices.to_vec();
        let mut valid = AluExp::bool(true);
        let mut offset = AluExp::i32(0);
        for (i, view) in self.views.iter().enumerate().rev() {
            let (off, v) = view.index_exp(&idxs);
            valid = AluExp::and(&valid, &v).simplify();
            offset = off.simplify();
            if i > 0 {
                idxs = AluExp::unflatten(&offset, &self.views[i - 1].shape);
            }
        }
        (offset, valid)
    }

    /// Numeric lowering: the linear offset for a concrete multi-index, or
    /// `None` if any mask rejects it.
    pub fn locate(&self, indices: &[i64]) -> Option<i64> {
        let mut idxs = indices.to_vec();
        let mut offset = 0i64;
        for (i, view) in self.views.iter().enumerate().rev() {
            offset = view.locate(&idxs)?;
            if i > 0 {
                idxs = unflatten_i64(offset, &self.views[i - 1].shape);
            }
        }
        Some(offset)
    }
}

fn unflatten_i64(flat: i64, shape: &[usize]) -> Vec<i64> {
    let mut out = Vec::with_capacity(shape.len());
    let mut inner: i64 = shape.iter().product::<usize>() as i64;
    for &dim in shape {
        inner /= dim as i64;
        out.push((flat / inner).rem_euclid(dim as i64));
    }
    out
}

/// Resolve a single `-1` dimension against a known total size.
fn infer_shape(shape: &[isize], total: usize) -> Vec<usize> {
    let holes = shape.iter().filter(|&&d| d == -1).count();
    assert!(holes <= 1, "at most one dimension may be -1");
    if holes == 0 {
        return shape
            .iter()
            .map(|&d| {
                assert!(d >= 0, "negative dimension {} in reshape", d);
                d as usize
            })
            .collect();
    }
    let known: usize = shape.iter().filter(|&&d| d != -1).map(|&d| d as usize).product();
    assert!(
        known > 0 && total % known == 0,
        "cannot infer -1 dimension: {} does not divide {}",
        known,
        total
    );
    shape
        .iter()
        .map(|&d| if d == -1 { total / known } else { d as usize })
        .collect()
}

/// Try to express `new_shape` over the same storage as `(old_shape,
/// old_strides)` without copying. Returns the new strides on success.
fn attempt_reshape(
    old_shape: &[usize],
    old_strides: &[isize],
    new_shape: &[usize],
) -> Option<Vec<isize>> {
    // Ignore size-1 dimensions of the old view; they carry no stride info.
    let olds: Vec<(usize, isize)> = old_shape
        .iter()
        .zip(old_strides)
        .filter(|(s, _)| **s != 1)
        .map(|(s, st)| (*s, *st))
        .collect();
    if olds.is_empty() {
        // Pure unit reshape: everything is stride 0 except a row-major tail.
        return Some(Shape::new(new_shape.to_vec()).default_strides());
    }

    let mut new_strides = vec![0isize; new_shape.len()];
    let mut oi = 0;
    let mut ni = 0;
    while ni < new_shape.len() {
        if new_shape[ni] == 1 {
            new_strides[ni] = 0;
            ni += 1;
            continue;
        }
        if oi >= olds.len() {
            return None;
        }
        let start_oi = oi;
        let start_ni = ni;
        let mut op = olds[oi].0;
        let mut np = new_shape[ni];
        while op != np {
            if op < np {
                oi += 1;
                if oi >= olds.len() {
                    return None;
                }
                op *= olds[oi].0;
            } else {
                ni += 1;
                if ni >= new_shape.len() {
                    return None;
                }
                np *= new_shape[ni];
            }
        }
        // The merged old dimensions must be mutually contiguous.
        for k in start_oi..oi {
            if olds[k].1 != olds[k + 1].1 * olds[k + 1].0 as isize {
                return None;
            }
        }
        // Split the chunk's base stride across the new dimensions.
        let mut stride = olds[oi].1;
        for k in (start_ni..=ni).rev() {
            if new_shape[k] == 1 {
                new_strides[k] = 0;
            } else {
                new_strides[k] = stride;
                stride *= new_shape[k] as isize;
            }
        }
        oi += 1;
        ni += 1;
    }
    Some(new_strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alu::{EvalEnv, Special};
    use crate::dtype::Scalar;
    use std::collections::HashMap;

    fn locate_all(t: &ShapeTracker) -> Vec<Option<i64>> {
        let shape = t.shape().to_vec();
        let size = t.size();
        let mut out = Vec::with_capacity(size);
        for flat in 0..size as i64 {
            let idxs = unflatten_i64(flat, &shape);
            out.push(t.locate(&idxs));
        }
        out
    }

    #[test]
    fn test_contiguous() {
        let t = ShapeTracker::from_shape(&[2, 3]);
        assert!(t.is_contiguous());
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.size(), 6);
        assert_eq!(locate_all(&t), (0..6).map(Some).collect::<Vec<_>>());
    }

    #[test]
    fn test_permute() {
        let t = ShapeTracker::from_shape(&[2, 3]).permute(&[1, 0]);
        assert_eq!(t.shape(), &[3, 2]);
        assert!(!t.is_contiguous());
        // [[0,3],[1,4],[2,5]]
        assert_eq!(
            locate_all(&t),
            vec![Some(0), Some(3), Some(1), Some(4), Some(2), Some(5)]
        );
    }

    #[test]
    fn test_reshape_merge_is_single_view() {
        let t = ShapeTracker::from_shape(&[2, 3, 4]).reshape(&[6, 4]);
        assert_eq!(t.views.len(), 1);
        assert!(t.is_contiguous());
    }

    #[test]
    fn test_reshape_after_permute_pushes_view() {
        // The transposed layout cannot be flattened in place.
        let t = ShapeTracker::from_shape(&[3, 4]).permute(&[1, 0]).reshape(&[2, 6]);
        assert_eq!(t.views.len(), 2);
        // arange(12).reshape(3,4).T.reshape(2,6) == [[0,4,8,1,5,9],[2,6,10,3,7,11]]
        let offsets: Vec<i64> = locate_all(&t).into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(offsets, vec![0, 4, 8, 1, 5, 9, 2, 6, 10, 3, 7, 11]);
    }

    #[test]
    fn test_reshape_infer() {
        let t = ShapeTracker::from_shape(&[2, 3, 4]).reshape(&[-1, 4]);
        assert_eq!(t.shape(), &[6, 4]);
    }

    #[test]
    #[should_panic(expected = "cannot reshape")]
    fn test_reshape_bad_size() {
        ShapeTracker::from_shape(&[2, 3]).reshape(&[4, 2]);
    }

    #[test]
    fn test_expand() {
        let t = ShapeTracker::from_shape(&[1, 3]).expand(&[4, 3]);
        assert_eq!(t.shape(), &[4, 3]);
        assert_eq!(t.last_strides(), &[0, 1]);
        let offsets: Vec<i64> = locate_all(&t).into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_flip() {
        let t = ShapeTracker::from_shape(&[4]).flip(&[true]);
        let offsets: Vec<i64> = locate_all(&t).into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(offsets, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_slice_with_step() {
        let t = ShapeTracker::from_shape(&[8]).slice(&[1], &[8], &[3]);
        assert_eq!(t.shape(), &[3]);
        let offsets: Vec<i64> = locate_all(&t).into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(offsets, vec![1, 4, 7]);
    }

    #[test]
    fn test_pad_masks() {
        let t = ShapeTracker::from_shape(&[2]).pad(&[(1, 1)]);
        assert_eq!(t.shape(), &[4]);
        assert_eq!(locate_all(&t), vec![None, Some(0), Some(1), None]);
    }

    #[test]
    fn test_pad_then_slice() {
        let t = ShapeTracker::from_shape(&[3]).pad(&[(2, 0)]).slice(&[1], &[5], &[1]);
        assert_eq!(t.shape(), &[4]);
        assert_eq!(locate_all(&t), vec![None, Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_compose() {
        let inner = ShapeTracker::from_shape(&[3, 4]).permute(&[1, 0]);
        let outer = ShapeTracker::from_shape(&[2, 6]);
        let t = outer.compose(&inner);
        assert_eq!(t.shape(), &[2, 6]);
        let offsets: Vec<i64> = locate_all(&t).into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(offsets, vec![0, 4, 8, 1, 5, 9, 2, 6, 10, 3, 7, 11]);
    }

    #[test]
    fn test_to_alu_exp_matches_locate() {
        let t = ShapeTracker::from_shape(&[3, 4])
            .permute(&[1, 0])
            .reshape(&[2, 6])
            .pad(&[(0, 0), (1, 0)]);
        let shape = t.shape().to_vec();
        let idx_exprs: Vec<AluExp> = (0..shape.len())
            .map(|d| AluExp::special([Special::Gidx, Special::Ridx][d], shape[d]))
            .collect();
        let (off, valid) = t.to_alu_exp(&idx_exprs);
        for i in 0..shape[0] as i64 {
            for j in 0..shape[1] as i64 {
                let mut specials = HashMap::new();
                specials.insert(Special::Gidx, Scalar::I32(i as i32));
                specials.insert(Special::Ridx, Scalar::I32(j as i32));
                let env = EvalEnv { specials: &specials, globals: &|_, _| unreachable!() };
                let symbolic_valid = valid.evaluate(&env).as_bool();
                match t.locate(&[i, j]) {
                    Some(expected) => {
                        assert!(symbolic_valid, "({}, {}) should be valid", i, j);
                        assert_eq!(off.evaluate(&env).as_i64(), expected);
                    }
                    None => assert!(!symbolic_valid, "({}, {}) should be masked", i, j),
                }
            }
        }
    }
}

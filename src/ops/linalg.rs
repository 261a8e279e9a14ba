//! Linear algebra built from movement + multiply + reduce.
//!
//! `matmul` lowers to a broadcast multiply feeding one reduction, so the
//! whole contraction is a single fused kernel.

use crate::array::Array;

impl Array {
    /// Matrix product with NumPy promotion rules for 1-D operands.
    ///
    /// Batched: `[..B, m, k] @ [..B, k, n] -> [..B, m, n]` with equal batch
    /// dims.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
    /// let b = Array::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]);
    /// assert_eq!(a.matmul(&b).to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    /// ```
    pub fn matmul(&self, other: &Array) -> Array {
        assert!(self.ndim() >= 1 && other.ndim() >= 1, "matmul needs rank >= 1");
        match (self.ndim(), other.ndim()) {
            (1, 1) => self.mul(other).sum(None, false),
            (1, _) => {
                let k = self.shape()[0];
                let widened = self.reshape(&[1, k as isize]).matmul(other);
                widened.squeeze_axis(widened.ndim() as isize - 2)
            }
            (_, 1) => {
                let k = other.shape()[0];
                let widened = self.matmul(&other.reshape(&[k as isize, 1]));
                widened.squeeze_axis(-1)
            }
            _ => {
                let (an, bn) = (self.ndim(), other.ndim());
                let (m, ka) = (self.shape()[an - 2], self.shape()[an - 1]);
                let (kb, n) = (other.shape()[bn - 2], other.shape()[bn - 1]);
                assert_eq!(ka, kb, "matmul inner dimensions differ: {} vs {}", ka, kb);
                assert_eq!(
                    &self.shape()[..an - 2],
                    &other.shape()[..bn - 2],
                    "matmul batch dimensions differ"
                );
                let batch = &self.shape()[..an - 2];

                // a: [..B, m, 1, k], b: [..B, 1, n, k], both -> [..B, m, n, k]
                let mut full = batch.to_vec();
                full.extend([m, n, ka]);
                let a = self.expand_dims(an - 1).broadcast_to(&full);
                let mut swap: Vec<usize> = (0..bn).collect();
                swap.swap(bn - 2, bn - 1);
                let b = other.transpose(Some(&swap)).expand_dims(bn - 2).broadcast_to(&full);
                a.mul(&b).sum(Some(-1), false)
            }
        }
    }

    /// Dot product: 1-D inner product, otherwise `matmul`.
    pub fn dot(&self, other: &Array) -> Array {
        if self.ndim() == 1 && other.ndim() == 1 {
            self.mul(other).sum(None, false)
        } else {
            self.matmul(other)
        }
    }

    /// Batched inner product over the last axis.
    pub fn vecdot(&self, other: &Array) -> Array {
        self.mul(other).sum(Some(-1), false)
    }
}

/// Two-operand (or single-operand) einsum over distinct index letters.
///
/// Supports contractions expressible as transpose/sum/matmul compositions,
/// e.g. `"ij,jk->ik"`, `"bij,bjk->bik"`, `"ij->ji"`, `"ii->i"` excluded
/// (no repeated letters within one operand).
///
/// # Panics
///
/// Panics on malformed specs or unsupported patterns.
pub fn einsum(spec: &str, operands: &[&Array]) -> Array {
    let (lhs, out_spec) = spec.split_once("->").unwrap_or_else(|| {
        panic!("einsum spec `{}` must contain ->", spec)
    });
    let in_specs: Vec<Vec<char>> =
        lhs.split(',').map(|s| s.trim().chars().collect()).collect();
    let out: Vec<char> = out_spec.trim().chars().collect();
    assert_eq!(in_specs.len(), operands.len(), "einsum operand count mismatch");
    for (s, a) in in_specs.iter().zip(operands) {
        assert_eq!(s.len(), a.ndim(), "einsum spec rank mismatch for `{}`", spec);
        let mut seen = std::collections::HashSet::new();
        assert!(
            s.iter().all(|c| seen.insert(*c)),
            "einsum: repeated index letters within one operand are unsupported"
        );
    }

    match operands {
        [a] => {
            let spec_in = &in_specs[0];
            // Sum away letters absent from the output, then permute.
            let mut cur = (*a).clone();
            let mut letters = spec_in.clone();
            for i in (0..letters.len()).rev() {
                if !out.contains(&letters[i]) {
                    cur = cur.sum(Some(i as isize), false);
                    letters.remove(i);
                }
            }
            let perm: Vec<usize> = out
                .iter()
                .map(|c| letters.iter().position(|l| l == c).expect("unknown output index"))
                .collect();
            cur.transpose(Some(&perm))
        }
        [a, b] => {
            let (sa, sb) = (&in_specs[0], &in_specs[1]);
            let mut a = (*a).clone();
            let mut b = (*b).clone();
            let mut sa = sa.clone();
            let mut sb = sb.clone();

            // Pre-sum letters unique to one operand and absent from output.
            for i in (0..sa.len()).rev() {
                if !sb.contains(&sa[i]) && !out.contains(&sa[i]) {
                    a = a.sum(Some(i as isize), false);
                    sa.remove(i);
                }
            }
            for i in (0..sb.len()).rev() {
                if !sa.contains(&sb[i]) && !out.contains(&sb[i]) {
                    b = b.sum(Some(i as isize), false);
                    sb.remove(i);
                }
            }

            let batch: Vec<char> =
                out.iter().filter(|c| sa.contains(c) && sb.contains(c)).copied().collect();
            let contracted: Vec<char> =
                sa.iter().filter(|c| sb.contains(c) && !out.contains(c)).copied().collect();
            let free_a: Vec<char> =
                sa.iter().filter(|c| !sb.contains(c)).copied().collect();
            let free_b: Vec<char> =
                sb.iter().filter(|c| !sa.contains(c)).copied().collect();

            let pos = |s: &[char], c: char| s.iter().position(|&l| l == c).unwrap();
            let dim = |arr: &Array, s: &[char], c: char| arr.shape()[pos(s, c)];

            // a -> [batch, free_a, contracted], b -> [batch, contracted, free_b]
            let perm_a: Vec<usize> = batch
                .iter()
                .chain(&free_a)
                .chain(&contracted)
                .map(|&c| pos(&sa, c))
                .collect();
            let perm_b: Vec<usize> = batch
                .iter()
                .chain(&contracted)
                .chain(&free_b)
                .map(|&c| pos(&sb, c))
                .collect();
            let bsize: usize = batch.iter().map(|&c| dim(&a, &sa, c)).product();
            let msize: usize = free_a.iter().map(|&c| dim(&a, &sa, c)).product();
            let ksize: usize = contracted.iter().map(|&c| dim(&a, &sa, c)).product();
            let nsize: usize = free_b.iter().map(|&c| dim(&b, &sb, c)).product();

            let batch_dims: Vec<usize> = batch.iter().map(|&c| dim(&a, &sa, c)).collect();
            let a3 = a
                .transpose(Some(&perm_a))
                .reshape(&[bsize as isize, msize as isize, ksize as isize]);
            let b3 = b
                .transpose(Some(&perm_b))
                .reshape(&[bsize as isize, ksize as isize, nsize as isize]);
            let prod = a3.matmul(&b3);

            // Unflatten to [batch..., free_a..., free_b...], then permute to
            // the requested output order.
            let mut dims: Vec<isize> = batch_dims.iter().map(|&d| d as isize).collect();
            dims.extend(free_a.iter().map(|&c| dim(&a, &sa, c) as isize));
            dims.extend(free_b.iter().map(|&c| dim(&b, &sb, c) as isize));
            let expanded = prod.reshape(&dims);
            let current: Vec<char> =
                batch.iter().chain(&free_a).chain(&free_b).copied().collect();
            let perm: Vec<usize> = out
                .iter()
                .map(|c| current.iter().position(|l| l == c).expect("unknown output index"))
                .collect();
            expanded.transpose(Some(&perm))
        }
        _ => panic!("einsum supports one or two operands"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_matmul_2x2() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Array::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]);
        assert_eq!(a.matmul(&b).to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_ones_64() {
        let n = 64;
        let a = Array::ones(&[n, n], DType::Float32);
        let c = a.matmul(&a);
        assert_eq!(c.shape(), &[n, n]);
        for v in c.to_vec() {
            assert!((v - n as f32).abs() < 1e-4);
        }
    }

    #[test]
    fn test_matmul_rectangular() {
        // [2,3] @ [3,2]
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = Array::from_vec(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]);
        assert_eq!(a.matmul(&b).to_vec(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_vector_cases() {
        let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        let m = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        // vec @ mat
        assert_eq!(a.matmul(&m).to_vec(), vec![7.0, 10.0]);
        // mat @ vec
        assert_eq!(m.matmul(&a).to_vec(), vec![5.0, 11.0]);
        // vec @ vec
        assert_eq!(a.matmul(&a).to_vec(), vec![5.0]);
    }

    #[test]
    fn test_matmul_batched() {
        let a = Array::arange(0.0, Some(8.0), 1.0, DType::Float32).reshape(&[2, 2, 2]);
        let b = Array::ones(&[2, 2, 2], DType::Float32);
        let c = a.matmul(&b);
        assert_eq!(c.shape(), &[2, 2, 2]);
        assert_eq!(c.to_vec(), vec![1.0, 1.0, 5.0, 5.0, 9.0, 9.0, 13.0, 13.0]);
    }

    #[test]
    fn test_dot_and_vecdot() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        let b = Array::from_vec(vec![4.0, 5.0, 6.0], &[3]);
        assert_eq!(a.dot(&b).to_vec(), vec![32.0]);

        let m = Array::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let v = Array::from_vec(vec![2.0, 3.0, 2.0, 3.0], &[2, 2]);
        assert_eq!(m.vecdot(&v).to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_einsum_matmul() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Array::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]);
        let c = einsum("ij,jk->ik", &[&a, &b]);
        assert_eq!(c.to_vec(), a.matmul(&b).to_vec());
    }

    #[test]
    fn test_einsum_transpose_and_trace_free() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let t = einsum("ij->ji", &[&a]);
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let s = einsum("ij->i", &[&a]);
        assert_eq!(s.to_vec(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_einsum_batched() {
        let a = Array::arange(0.0, Some(8.0), 1.0, DType::Float32).reshape(&[2, 2, 2]);
        let b = Array::ones(&[2, 2, 2], DType::Float32);
        let c = einsum("bij,bjk->bik", &[&a, &b]);
        assert_eq!(c.to_vec(), a.matmul(&b).to_vec());
    }

    #[test]
    fn test_einsum_outer() {
        let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        let b = Array::from_vec(vec![3.0, 4.0, 5.0], &[3]);
        let c = einsum("i,j->ij", &[&a, &b]);
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
    }
}

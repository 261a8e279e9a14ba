//! Automatic batching: `vmap`.
//!
//! Traces the function on a peeled (unbatched) slice of its arguments, then
//! re-interprets the jaxpr with a batch axis carried per value. Each
//! primitive's batch rule rewrites the operation to preserve the batch
//! axis; nested `vmap` composes because the batched interpretation itself
//! records into any enclosing trace.

use crate::array::Array;
use crate::trace::jaxpr::{Atom, Jaxpr};
use crate::trace::primitive::{apply, Primitive};
use crate::trace::tracer::trace;

/// A value during batched interpretation: the array plus the axis carrying
/// the batch (None for unbatched captures).
type Batched = (Array, Option<usize>);

fn to_front(x: &Array, bdim: usize) -> Array {
    if bdim == 0 {
        x.clone()
    } else {
        x.moveaxis(bdim as isize, 0)
    }
}

/// Slice index 0 along `axis` and drop the axis.
fn peel(x: &Array, axis: usize) -> Array {
    let moved = to_front(x, axis);
    let mut stops = moved.shape().to_vec();
    stops[0] = 1;
    let starts = vec![0; moved.ndim()];
    moved.slice(&starts, &stops, None).squeeze_axis(0)
}

/// Slice element `b` along the batch axis of a batched value.
fn element(x: &Array, bdim: usize, b: usize) -> Array {
    let moved = to_front(x, bdim);
    let mut starts = vec![0; moved.ndim()];
    let mut stops = moved.shape().to_vec();
    starts[0] = b;
    stops[0] = b + 1;
    moved.slice(&starts, &stops, None).squeeze_axis(0)
}

/// Apply one primitive under batching.
pub(crate) fn batch_rule(prim: &Primitive, inputs: &[Batched], batch: usize) -> Batched {
    if inputs.iter().all(|(_, bd)| bd.is_none()) {
        let refs: Vec<&Array> = inputs.iter().map(|(a, _)| a).collect();
        return (apply(prim, &refs), None);
    }
    match prim {
        p if p.is_elementwise() => {
            // Batched operands move their axis to the front; unbatched ones
            // broadcast against the leading batch dimension.
            let moved: Vec<Array> = inputs
                .iter()
                .map(|(a, bd)| match bd {
                    Some(d) => to_front(a, *d),
                    None => a.clone(),
                })
                .collect();
            let refs: Vec<&Array> = moved.iter().collect();
            (apply(prim, &refs), Some(0))
        }
        Primitive::Reduce { op, axis, keepdims } => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched reduce"));
            let out = moved.reduce_axis(*op, axis + 1, *keepdims);
            (out, Some(0))
        }
        Primitive::Mean { axis, keepdims } => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched mean"));
            (moved.mean(Some((axis + 1) as isize), *keepdims), Some(0))
        }
        Primitive::Reshape(shape) => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched reshape"));
            let mut new_shape: Vec<isize> = vec![batch as isize];
            new_shape.extend(shape.iter().map(|&d| d as isize));
            (moved.reshape(&new_shape), Some(0))
        }
        Primitive::Transpose(perm) => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched transpose"));
            let mut p = vec![0usize];
            p.extend(perm.iter().map(|&a| a + 1));
            (moved.transpose(Some(&p)), Some(0))
        }
        Primitive::Broadcast(target) => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched broadcast"));
            // Insert the new broadcast axes after the batch dimension.
            let lead = target.len() + 1 - moved.ndim();
            let mut widened: Vec<isize> = vec![batch as isize];
            widened.extend(std::iter::repeat(1).take(lead));
            widened.extend(moved.shape()[1..].iter().map(|&d| d as isize));
            let mut full = vec![batch];
            full.extend(target.iter().copied());
            (moved.reshape(&widened).broadcast_to(&full), Some(0))
        }
        Primitive::Slice { starts, stops, steps } => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched slice"));
            let mut s0 = vec![0];
            s0.extend_from_slice(starts);
            let mut s1 = vec![batch];
            s1.extend_from_slice(stops);
            let mut s2 = vec![1];
            s2.extend_from_slice(steps);
            (moved.slice(&s0, &s1, Some(&s2)), Some(0))
        }
        Primitive::Flip(mask) => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched flip"));
            let axes: Vec<isize> = mask
                .iter()
                .enumerate()
                .filter(|(_, &f)| f)
                .map(|(a, _)| (a + 1) as isize)
                .collect();
            (moved.flip(&axes), Some(0))
        }
        Primitive::Pad(widths) => {
            let (x, bd) = &inputs[0];
            let moved = to_front(x, bd.expect("batched pad"));
            let mut w = vec![(0, 0)];
            w.extend_from_slice(widths);
            (moved.pad(&w), Some(0))
        }
        Primitive::RandomBits { .. } | Primitive::Routine(_) => {
            // No batched formulation: evaluate per element and stack. This
            // keeps batched RNG bit-identical to the per-key streams.
            let per_element: Vec<Array> = (0..batch)
                .map(|b| {
                    let slices: Vec<Array> = inputs
                        .iter()
                        .map(|(a, bd)| match bd {
                            Some(d) => element(a, *d, b),
                            None => a.clone(),
                        })
                        .collect();
                    let refs: Vec<&Array> = slices.iter().collect();
                    apply(prim, &refs)
                })
                .collect();
            let refs: Vec<&Array> = per_element.iter().collect();
            (Array::stack(&refs, 0), Some(0))
        }
        _ => unreachable!("batch rule for {:?}", prim),
    }
}

/// Interpret a jaxpr with batched inputs.
pub(crate) fn batch_eval(jaxpr: &Jaxpr, args: Vec<Batched>, batch: usize) -> Vec<Batched> {
    let mut env: Vec<Option<Batched>> = vec![None; jaxpr.var_count()];
    for (i, a) in args.into_iter().enumerate() {
        env[i] = Some(a);
    }
    let resolve = |atom: Atom, env: &[Option<Batched>]| -> Batched {
        match atom {
            Atom::Var(v) => env[v].clone().expect("use of undefined variable"),
            Atom::Const(c) => (jaxpr.consts[c].clone(), None),
        }
    };
    for eqn in &jaxpr.eqns {
        let inputs: Vec<Batched> = eqn.inputs.iter().map(|&a| resolve(a, &env)).collect();
        env[eqn.output] = Some(batch_rule(&eqn.prim, &inputs, batch));
    }
    jaxpr.outvars.iter().map(|&a| resolve(a, &env)).collect()
}

/// Vectorize a one-argument function over `in_axis`.
///
/// # Examples
///
/// ```
/// # use microjax::{vmap, Array};
/// let f = vmap(|x: &Array| x.sum(None, false), 0);
/// let xs = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(f(&xs).to_vec(), vec![3.0, 7.0]);
/// ```
pub fn vmap<F>(f: F, in_axis: usize) -> impl Fn(&Array) -> Array
where
    F: Fn(&Array) -> Array,
{
    move |x: &Array| {
        assert!(in_axis < x.ndim(), "vmap axis {} out of bounds", in_axis);
        let batch = x.shape()[in_axis];
        let example = peel(x, in_axis);
        let wrapper = |xs: &[Array]| vec![f(&xs[0])];
        let (_, jaxpr) = trace("vmap", &wrapper, &[example]);
        let outs = batch_eval(&jaxpr, vec![(x.clone(), Some(in_axis))], batch);
        finalize(outs.into_iter().next().expect("one output"), batch)
    }
}

/// Vectorize a two-argument function, both mapped over `in_axis`.
pub fn vmap2<F>(f: F, in_axis: usize) -> impl Fn(&Array, &Array) -> Array
where
    F: Fn(&Array, &Array) -> Array,
{
    move |x: &Array, y: &Array| {
        let batch = x.shape()[in_axis];
        assert_eq!(batch, y.shape()[in_axis], "vmap batch sizes must match");
        let ex = peel(x, in_axis);
        let ey = peel(y, in_axis);
        let wrapper = |xs: &[Array]| vec![f(&xs[0], &xs[1])];
        let (_, jaxpr) = trace("vmap2", &wrapper, &[ex, ey]);
        let outs = batch_eval(
            &jaxpr,
            vec![(x.clone(), Some(in_axis)), (y.clone(), Some(in_axis))],
            batch,
        );
        finalize(outs.into_iter().next().expect("one output"), batch)
    }
}

/// Place the batch axis at 0 (or materialize it for unbatched outputs).
fn finalize((out, bdim): Batched, batch: usize) -> Array {
    match bdim {
        Some(0) => out,
        Some(d) => out.moveaxis(d as isize, 0),
        None => {
            let mut target = vec![batch];
            target.extend_from_slice(out.shape());
            out.broadcast_to(&target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_vmap_elementwise() {
        let f = vmap(|x: &Array| x.mul(x), 0);
        let xs = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(f(&xs).to_vec(), vec![1.0, 4.0, 9.0, 16.0, 25.0, 36.0]);
    }

    #[test]
    fn test_vmap_reduction() {
        let f = vmap(|x: &Array| x.sum(None, false), 0);
        let xs = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        assert_eq!(f(&xs).to_vec(), vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_vmap_axis_one() {
        let f = vmap(|x: &Array| x.sum(None, false), 1);
        let xs = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        // Columns: [1,4], [2,5], [3,6]
        assert_eq!(f(&xs).to_vec(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_vmap2_dot() {
        let f = vmap2(|x: &Array, y: &Array| x.mul(y).sum(None, false), 0);
        let xs = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let ys = Array::from_vec(vec![10.0, 10.0, 10.0, 10.0], &[2, 2]);
        assert_eq!(f(&xs, &ys).to_vec(), vec![30.0, 70.0]);
    }

    #[test]
    fn test_vmap_with_captured_constant() {
        let w = Array::from_vec(vec![10.0, 100.0], &[2]);
        let f = vmap(move |x: &Array| x.mul(&w), 0);
        let xs = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(f(&xs).to_vec(), vec![10.0, 200.0, 30.0, 400.0]);
    }

    #[test]
    fn test_vmap_movement() {
        let f = vmap(|x: &Array| x.reshape(&[2, 2]).transpose(None).reshape(&[4]), 0);
        let xs = Array::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 4]);
        assert_eq!(f(&xs).to_vec(), vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }

    #[test]
    fn test_vmap_matches_loop() {
        let g = |x: &Array| x.exp().sum(None, false);
        let f = vmap(g, 0);
        let xs = Array::from_vec(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &[3, 2]);
        let batched = f(&xs).to_vec();
        for b in 0..3 {
            let row = element(&xs, 0, b);
            let single = g(&row).to_vec()[0];
            assert!((batched[b] - single).abs() < 1e-6);
        }
    }

    #[test]
    fn test_nested_vmap() {
        let inner = |x: &Array| x.mul(x).sum(None, false);
        let f = vmap(move |row: &Array| vmap(inner, 0)(&row.reshape(&[2, 2])), 0);
        let xs = Array::from_vec((0..8).map(|v| v as f32).collect(), &[2, 4]);
        // Each row [a,b,c,d] -> [a^2+b^2, c^2+d^2]
        assert_eq!(f(&xs).to_vec(), vec![1.0, 13.0, 41.0, 85.0]);
    }

    #[test]
    fn test_vmap_unbatched_output_broadcasts() {
        // Output ignores the batched input entirely.
        let c = Array::from_vec(vec![7.0], &[1]);
        let f = vmap(move |_: &Array| c.realize().unwrap(), 0);
        let xs = Array::zeros(&[3, 2], DType::Float32);
        let out = f(&xs);
        assert_eq!(out.shape(), &[3, 1]);
        assert_eq!(out.to_vec(), vec![7.0, 7.0, 7.0]);
    }
}

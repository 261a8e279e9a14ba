//! Reverse-mode differentiation: vector-jacobian products and `grad`.
//!
//! `vjp` linearizes by evaluating the jaxpr forward (storing every primal
//! intermediate), then transposes the linearized equations in reverse,
//! accumulating cotangents per variable. `grad` wraps `vjp` for
//! scalar-valued functions with a unit output cotangent.

use crate::array::Array;
use crate::kernel::ReduceOp;
use crate::trace::jaxpr::{Atom, Jaxpr};
use crate::trace::jvp::{keep_axis, FRAC_2_SQRT_PI};
use crate::trace::primitive::{apply, Primitive};
use crate::trace::tracer::trace;

/// The pullback returned by [`vjp`]: maps output cotangents to input
/// cotangents.
pub struct VjpFn {
    jaxpr: Jaxpr,
    primal_env: Vec<Option<Array>>,
}

impl VjpFn {
    /// Apply the transposed linearization to output cotangents.
    pub fn call(&self, cotangents: &[Array]) -> Vec<Array> {
        assert_eq!(cotangents.len(), self.jaxpr.outvars.len(), "one cotangent per output");
        let mut ct_env: Vec<Option<Array>> = vec![None; self.jaxpr.var_count()];
        for (&atom, ct) in self.jaxpr.outvars.iter().zip(cotangents) {
            if let Atom::Var(v) = atom {
                accumulate(&mut ct_env[v], ct.clone());
            }
        }

        for eqn in self.jaxpr.eqns.iter().rev() {
            let Some(out_ct) = ct_env[eqn.output].clone() else { continue };
            let primals: Vec<Array> =
                eqn.inputs.iter().map(|&a| self.jaxpr.resolve(a, &self.primal_env)).collect();
            let refs: Vec<&Array> = primals.iter().collect();
            let out = self.primal_env[eqn.output].as_ref().expect("forward pass ran");
            let input_cts = transpose_rule(&eqn.prim, &out_ct, &refs, out);
            for (&atom, ct) in eqn.inputs.iter().zip(input_cts) {
                if let (Atom::Var(v), Some(ct)) = (atom, ct) {
                    accumulate(&mut ct_env[v], ct);
                }
            }
        }

        (0..self.jaxpr.num_inputs)
            .map(|v| {
                ct_env[v].clone().unwrap_or_else(|| {
                    let aval = &self.jaxpr.in_avals[v];
                    Array::zeros(&aval.shape, aval.dtype)
                })
            })
            .collect()
    }
}

fn accumulate(slot: &mut Option<Array>, ct: Array) {
    *slot = Some(match slot.take() {
        Some(prev) => prev.add(&ct),
        None => ct,
    });
}

/// Trace `f` at `primals` and return its outputs plus the pullback.
///
/// # Examples
///
/// ```
/// # use microjax::{vjp, Array};
/// let f = |xs: &[Array]| vec![xs[0].mul(&xs[0])];
/// let x = Array::from_vec(vec![3.0], &[1]);
/// let (y, pullback) = vjp(f, &[x]);
/// assert_eq!(y[0].to_vec(), vec![9.0]);
/// let ct = Array::from_vec(vec![1.0], &[1]);
/// assert_eq!(pullback.call(&[ct])[0].to_vec(), vec![6.0]);
/// ```
pub fn vjp<F>(f: F, primals: &[Array]) -> (Vec<Array>, VjpFn)
where
    F: Fn(&[Array]) -> Vec<Array>,
{
    let (_, jaxpr) = trace("vjp", &f, primals);

    // Forward pass: store every intermediate for the transpose rules.
    let mut env: Vec<Option<Array>> = vec![None; jaxpr.var_count()];
    for (i, p) in primals.iter().enumerate() {
        env[i] = Some(p.clone());
    }
    for eqn in &jaxpr.eqns {
        let inputs: Vec<Array> = eqn.inputs.iter().map(|&a| jaxpr.resolve(a, &env)).collect();
        let refs: Vec<&Array> = inputs.iter().collect();
        env[eqn.output] = Some(apply(&eqn.prim, &refs));
    }
    let outputs: Vec<Array> = jaxpr.outvars.iter().map(|&a| jaxpr.resolve(a, &env)).collect();
    (outputs, VjpFn { jaxpr, primal_env: env })
}

/// Gradient of a scalar-valued function of one array.
///
/// # Examples
///
/// ```
/// # use microjax::{grad, Array};
/// let df = grad(|x: &Array| x.mul(x).sum(None, false));
/// let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
/// assert_eq!(df(&x).to_vec(), vec![2.0, 4.0, 6.0]);
/// ```
pub fn grad<F>(f: F) -> impl Fn(&Array) -> Array
where
    F: Fn(&Array) -> Array,
{
    move |x: &Array| value_and_grad_impl(&f, x).1
}

/// Value and gradient in one pass.
pub fn value_and_grad<F>(f: F) -> impl Fn(&Array) -> (Array, Array)
where
    F: Fn(&Array) -> Array,
{
    move |x: &Array| value_and_grad_impl(&f, x)
}

fn value_and_grad_impl<F>(f: &F, x: &Array) -> (Array, Array)
where
    F: Fn(&Array) -> Array,
{
    let wrapper = |xs: &[Array]| vec![f(&xs[0])];
    let (outputs, pullback) = vjp(wrapper, &[x.clone()]);
    let y = outputs.into_iter().next().expect("one output");
    assert!(
        y.size() == 1,
        "grad requires a scalar-valued function, got shape {:?}",
        y.shape()
    );
    assert!(y.dtype().is_float(), "grad requires a float-valued function");
    let ct = Array::ones(y.shape(), y.dtype());
    let grads = pullback.call(&[ct]);
    (y, grads.into_iter().next().expect("one gradient"))
}

fn zero_like(x: &Array) -> Array {
    Array::zeros(x.shape(), x.dtype())
}

/// Cotangent contributions of one equation's inputs.
///
/// These are the transposes of the jvp linearizations: linear primitives
/// transpose directly; nonlinear ones transpose their tangent map with
/// primal-dependent coefficients.
pub(crate) fn transpose_rule(
    prim: &Primitive,
    ct: &Array,
    primals: &[&Array],
    out: &Array,
) -> Vec<Option<Array>> {
    match prim {
        Primitive::Add => vec![Some(ct.clone()), Some(ct.clone())],
        Primitive::Sub => vec![Some(ct.clone()), Some(ct.neg())],
        Primitive::Mul => {
            vec![Some(ct.mul(primals[1])), Some(ct.mul(primals[0]))]
        }
        Primitive::Div => {
            let (a, b) = (primals[0], primals[1]);
            vec![
                Some(ct.div(b)),
                Some(ct.mul(a).div(&b.mul(b)).neg()),
            ]
        }
        Primitive::Pow => {
            let (a, b) = (primals[0], primals[1]);
            let da = ct.mul(b).mul(&a.pow(&b.sub_scalar(1.0)));
            let db = ct.mul(out).mul(&a.log());
            vec![Some(da), Some(db)]
        }
        Primitive::Min => {
            let pick = primals[0].le(primals[1]);
            vec![
                Some(Array::where_(&pick, ct, &zero_like(ct))),
                Some(Array::where_(&pick, &zero_like(ct), ct)),
            ]
        }
        Primitive::Max => {
            let pick = primals[0].ge(primals[1]);
            vec![
                Some(Array::where_(&pick, ct, &zero_like(ct))),
                Some(Array::where_(&pick, &zero_like(ct), ct)),
            ]
        }
        Primitive::Neg => vec![Some(ct.neg())],
        Primitive::Abs => {
            let nonneg = primals[0].ge(&zero_like(primals[0]));
            vec![Some(Array::where_(&nonneg, ct, &ct.neg()))]
        }
        Primitive::Exp => vec![Some(ct.mul(out))],
        Primitive::Log => vec![Some(ct.div(primals[0]))],
        Primitive::Sin => vec![Some(ct.mul(&primals[0].cos()))],
        Primitive::Cos => vec![Some(ct.mul(&primals[0].sin()).neg())],
        Primitive::Tan => vec![Some(ct.mul(&out.mul(out).add_scalar(1.0)))],
        Primitive::Atan => {
            vec![Some(ct.div(&primals[0].mul(primals[0]).add_scalar(1.0)))]
        }
        Primitive::Asin => {
            let denom = Array::ones(primals[0].shape(), primals[0].dtype())
                .sub(&primals[0].mul(primals[0]))
                .sqrt();
            vec![Some(ct.div(&denom))]
        }
        Primitive::Sqrt => vec![Some(ct.div(&out.mul_scalar(2.0)))],
        Primitive::Recip => vec![Some(ct.mul(&out.mul(out)).neg())],
        Primitive::Erf => {
            let coeff = primals[0].mul(primals[0]).neg().exp().mul_scalar(FRAC_2_SQRT_PI);
            vec![Some(ct.mul(&coeff))]
        }
        Primitive::Erfc => {
            let coeff = primals[0].mul(primals[0]).neg().exp().mul_scalar(-FRAC_2_SQRT_PI);
            vec![Some(ct.mul(&coeff))]
        }
        Primitive::Where => {
            vec![
                None,
                Some(Array::where_(primals[0], ct, &zero_like(ct))),
                Some(Array::where_(primals[0], &zero_like(ct), ct)),
            ]
        }
        Primitive::Cast(_) => {
            if primals[0].dtype().is_float() && ct.dtype().is_float() {
                vec![Some(ct.astype(primals[0].dtype()))]
            } else {
                vec![None]
            }
        }
        Primitive::Reduce { op: ReduceOp::Add, axis, keepdims } => {
            let ctk = keep_axis(ct, primals[0], *axis, *keepdims);
            vec![Some(ctk.broadcast_to(primals[0].shape()))]
        }
        Primitive::Mean { axis, keepdims } => {
            let n = primals[0].shape()[*axis] as f64;
            let ctk = keep_axis(ct, primals[0], *axis, *keepdims);
            vec![Some(ctk.broadcast_to(primals[0].shape()).div_scalar(n))]
        }
        Primitive::Reduce { op: ReduceOp::Mul, axis, keepdims } => {
            let ctk = keep_axis(ct, primals[0], *axis, *keepdims).broadcast_to(primals[0].shape());
            let outk =
                keep_axis(out, primals[0], *axis, *keepdims).broadcast_to(primals[0].shape());
            vec![Some(ctk.mul(&outk.div(primals[0])))]
        }
        Primitive::Reduce { op: _, axis, keepdims } => {
            // min/max: route the cotangent to attaining elements.
            let outk =
                keep_axis(out, primals[0], *axis, *keepdims).broadcast_to(primals[0].shape());
            let mask = primals[0].eq(&outk);
            let ctk = keep_axis(ct, primals[0], *axis, *keepdims).broadcast_to(primals[0].shape());
            vec![Some(Array::where_(&mask, &ctk, &zero_like(primals[0])))]
        }
        Primitive::Reshape(_) => {
            let shape: Vec<isize> = primals[0].shape().iter().map(|&d| d as isize).collect();
            vec![Some(ct.reshape(&shape))]
        }
        Primitive::Transpose(perm) => {
            let mut inverse = vec![0usize; perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                inverse[p] = i;
            }
            vec![Some(ct.transpose(Some(&inverse)))]
        }
        Primitive::Broadcast(target) => {
            let in_shape = primals[0].shape().to_vec();
            let lead = target.len() - in_shape.len();
            let mut cur = ct.clone();
            for _ in 0..lead {
                cur = cur.sum(Some(0), false);
            }
            for (d, &in_d) in in_shape.iter().enumerate() {
                if in_d == 1 && target[lead + d] != 1 {
                    cur = cur.sum(Some(d as isize), true);
                }
            }
            vec![Some(cur)]
        }
        Primitive::Slice { starts, stops, steps } => {
            assert!(
                steps.iter().all(|&s| s == 1),
                "transpose of a strided slice is not supported"
            );
            let widths: Vec<(usize, usize)> = primals[0]
                .shape()
                .iter()
                .zip(starts.iter().zip(stops))
                .map(|(&dim, (&lo, &hi))| (lo, dim - hi))
                .collect();
            vec![Some(ct.pad(&widths))]
        }
        Primitive::Flip(mask) => {
            let axes: Vec<isize> = mask
                .iter()
                .enumerate()
                .filter(|(_, &f)| f)
                .map(|(a, _)| a as isize)
                .collect();
            vec![Some(ct.flip(&axes))]
        }
        Primitive::Pad(widths) => {
            let starts: Vec<usize> = widths.iter().map(|&(b, _)| b).collect();
            let stops: Vec<usize> = primals[0]
                .shape()
                .iter()
                .zip(widths)
                .map(|(&d, &(b, _))| b + d)
                .collect();
            vec![Some(ct.slice(&starts, &stops, None))]
        }
        Primitive::Eq
        | Primitive::Ne
        | Primitive::Lt
        | Primitive::Le
        | Primitive::Gt
        | Primitive::Ge
        | Primitive::RandomBits { .. }
        | Primitive::Routine(_) => vec![None; primals.len()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grad_square_sum() {
        let df = grad(|x: &Array| x.mul(x).sum(None, false));
        let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        assert_eq!(df(&x).to_vec(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_grad_reciprocal_sum() {
        // f(x) = sum(1/x); df = -1/x^2
        let df = grad(|x: &Array| x.reciprocal().sum(None, false));
        let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        let g = df(&x).to_vec();
        let expected = [-1.0f32, -0.25, -1.0 / 9.0];
        for (got, want) in g.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_value_and_grad() {
        let f = value_and_grad(|x: &Array| x.exp().sum(None, false));
        let x = Array::from_vec(vec![0.0, 1.0], &[2]);
        let (y, g) = f(&x);
        assert!((y.to_vec()[0] - (1.0 + std::f32::consts::E)).abs() < 1e-5);
        assert!((g.to_vec()[0] - 1.0).abs() < 1e-6);
        assert!((g.to_vec()[1] - std::f32::consts::E).abs() < 1e-5);
    }

    #[test]
    fn test_grad_through_movement() {
        // f(x) = sum(transpose(reshape(x)) * w)
        let w = Array::from_vec(vec![1.0, 10.0, 100.0, 1000.0], &[2, 2]);
        let df = grad(move |x: &Array| {
            x.reshape(&[2, 2]).transpose(None).mul(&w).sum(None, false)
        });
        let x = Array::from_vec(vec![1.0, 1.0, 1.0, 1.0], &[4]);
        // d/dx[i] = w[transpose position of i]
        assert_eq!(df(&x).to_vec(), vec![1.0, 100.0, 10.0, 1000.0]);
    }

    #[test]
    fn test_grad_of_max_reduction() {
        let df = grad(|x: &Array| x.max(None, false));
        let x = Array::from_vec(vec![1.0, 5.0, 3.0], &[3]);
        assert_eq!(df(&x).to_vec(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_grad_broadcast_sums_cotangent() {
        // f(x) = sum(x * ones[3,2]) with x: [2]; grad = [3, 3]
        let df = grad(|x: &Array| {
            x.broadcast_to(&[3, 2]).sum(None, false)
        });
        let x = Array::from_vec(vec![1.0, 2.0], &[2]);
        assert_eq!(df(&x).to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_grad_pad_slice_inverses() {
        let df = grad(|x: &Array| x.pad(&[(1, 1)]).sum(None, false));
        let x = Array::from_vec(vec![1.0, 2.0], &[2]);
        assert_eq!(df(&x).to_vec(), vec![1.0, 1.0]);

        let dg = grad(|x: &Array| x.slice(&[1], &[3], None).sum(None, false));
        let y = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[4]);
        assert_eq!(dg(&y).to_vec(), vec![0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_grad_matmul_composite() {
        // f(A) = sum(A @ B); dA = ones @ B^T
        let b = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let df = grad(move |a: &Array| a.matmul(&b).sum(None, false));
        let a = Array::ones(&[2, 2], crate::DType::Float32);
        // row sums of B: [3, 7]
        assert_eq!(df(&a).to_vec(), vec![3.0, 7.0, 3.0, 7.0]);
    }

    #[test]
    fn test_grad_finite_difference() {
        let f = |x: &Array| x.sin().mul(&x.exp()).sum(None, false);
        let df = grad(f);
        let x = Array::from_vec(vec![0.4, -0.9, 1.3], &[3]);
        let g = df(&x).to_vec();
        let eps = 1e-3f32;
        for i in 0..3 {
            let mut up = x.to_vec();
            let mut dn = x.to_vec();
            up[i] += eps;
            dn[i] -= eps;
            let fd = (f(&Array::from_vec(up, &[3])).to_vec()[0]
                - f(&Array::from_vec(dn, &[3])).to_vec()[0])
                / (2.0 * eps);
            assert!((g[i] - fd).abs() < 1e-2, "component {}: {} vs {}", i, g[i], fd);
        }
    }

    #[test]
    #[should_panic(expected = "scalar-valued")]
    fn test_grad_requires_scalar() {
        let df = grad(|x: &Array| x.mul(x));
        df(&Array::from_vec(vec![1.0, 2.0], &[2]));
    }

    #[test]
    fn test_grad_of_grad() {
        // f(x) = x^3 (via mul); f'' = 6x
        let ddf = grad(|x: &Array| {
            let df = grad(|y: &Array| y.mul(y).mul(y).sum(None, false));
            df(x).sum(None, false)
        });
        let x = Array::from_vec(vec![2.0], &[1]);
        assert!((ddf(&x).to_vec()[0] - 12.0).abs() < 1e-5);
    }
}

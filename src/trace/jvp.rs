//! Forward-mode differentiation: jacobian-vector products.
//!
//! Traces the function, then re-interprets the jaxpr with (primal, tangent)
//! pairs. Per-primitive rules build each tangent as a linear combination of
//! the input tangents with primal-dependent coefficients.

use crate::array::Array;
use crate::kernel::ReduceOp;
use crate::trace::jaxpr::{Atom, Jaxpr};
use crate::trace::primitive::{apply, Primitive};
use crate::trace::tracer::trace;

/// Compute `(f(primals), df(primals) . tangents)`.
///
/// # Examples
///
/// ```
/// # use microjax::{jvp, Array};
/// let f = |xs: &[Array]| vec![xs[0].mul(&xs[0])];
/// let x = Array::from_vec(vec![3.0], &[1]);
/// let t = Array::from_vec(vec![1.0], &[1]);
/// let (y, dy) = jvp(f, &[x], &[t]);
/// assert_eq!(y[0].to_vec(), vec![9.0]);
/// assert_eq!(dy[0].to_vec(), vec![6.0]);
/// ```
pub fn jvp<F>(f: F, primals: &[Array], tangents: &[Array]) -> (Vec<Array>, Vec<Array>)
where
    F: Fn(&[Array]) -> Vec<Array>,
{
    assert_eq!(primals.len(), tangents.len(), "one tangent per primal");
    for (p, t) in primals.iter().zip(tangents) {
        assert_eq!(p.shape(), t.shape(), "tangent shape mismatch");
        assert_eq!(p.dtype(), t.dtype(), "tangent dtype mismatch");
    }
    let (_, jaxpr) = trace("jvp", &f, primals);
    eval_jvp(&jaxpr, primals, tangents)
}

pub(crate) fn eval_jvp(
    jaxpr: &Jaxpr,
    primals: &[Array],
    tangents: &[Array],
) -> (Vec<Array>, Vec<Array>) {
    let mut env_p: Vec<Option<Array>> = vec![None; jaxpr.var_count()];
    let mut env_t: Vec<Option<Array>> = vec![None; jaxpr.var_count()];
    for (i, (p, t)) in primals.iter().zip(tangents).enumerate() {
        env_p[i] = Some(p.clone());
        env_t[i] = Some(t.clone());
    }

    for eqn in &jaxpr.eqns {
        let inputs: Vec<Array> = eqn.inputs.iter().map(|&a| jaxpr.resolve(a, &env_p)).collect();
        let input_tans: Vec<Option<Array>> = eqn
            .inputs
            .iter()
            .map(|&a| match a {
                Atom::Var(v) => env_t[v].clone(),
                Atom::Const(_) => None,
            })
            .collect();
        let refs: Vec<&Array> = inputs.iter().collect();
        let out = apply(&eqn.prim, &refs);
        let tan_refs: Vec<Option<&Array>> = input_tans.iter().map(|t| t.as_ref()).collect();
        env_t[eqn.output] = jvp_rule(&eqn.prim, &refs, &tan_refs, &out);
        env_p[eqn.output] = Some(out);
    }

    let outs: Vec<Array> = jaxpr.outvars.iter().map(|&a| jaxpr.resolve(a, &env_p)).collect();
    let out_tans: Vec<Array> = jaxpr
        .outvars
        .iter()
        .zip(&outs)
        .map(|(&a, out)| {
            let t = match a {
                Atom::Var(v) => env_t[v].clone(),
                Atom::Const(_) => None,
            };
            t.unwrap_or_else(|| Array::zeros(out.shape(), out.dtype()))
        })
        .collect();
    (outs, out_tans)
}

fn zero_like(x: &Array) -> Array {
    Array::zeros(x.shape(), x.dtype())
}

fn tan_or_zero(t: Option<&Array>, like: &Array) -> Array {
    t.cloned().unwrap_or_else(|| zero_like(like))
}

/// The tangent of one primitive application, or `None` when the output does
/// not carry derivatives (integer/bool results, RNG, routines).
pub(crate) fn jvp_rule(
    prim: &Primitive,
    primals: &[&Array],
    tangents: &[Option<&Array>],
    out: &Array,
) -> Option<Array> {
    if !out.dtype().is_float() {
        return None;
    }
    if tangents.iter().all(|t| t.is_none()) {
        return None;
    }
    Some(match prim {
        Primitive::Add => {
            tan_or_zero(tangents[0], primals[0]).add(&tan_or_zero(tangents[1], primals[1]))
        }
        Primitive::Sub => {
            tan_or_zero(tangents[0], primals[0]).sub(&tan_or_zero(tangents[1], primals[1]))
        }
        Primitive::Mul => {
            let ta = tan_or_zero(tangents[0], primals[0]).mul(primals[1]);
            let tb = primals[0].mul(&tan_or_zero(tangents[1], primals[1]));
            ta.add(&tb)
        }
        Primitive::Div => {
            // (ta - out * tb) / b
            let ta = tan_or_zero(tangents[0], primals[0]);
            let tb = tan_or_zero(tangents[1], primals[1]);
            ta.sub(&out.mul(&tb)).div(primals[1])
        }
        Primitive::Pow => {
            // out * (tb * log(a) + b * ta / a)
            let (a, b) = (primals[0], primals[1]);
            let mut acc: Option<Array> = None;
            if let Some(ta) = tangents[0] {
                acc = Some(b.mul(ta).div(a));
            }
            if let Some(tb) = tangents[1] {
                let term = tb.mul(&a.log());
                acc = Some(match acc {
                    Some(prev) => prev.add(&term),
                    None => term,
                });
            }
            out.mul(&acc.expect("some tangent present"))
        }
        Primitive::Min => {
            let pick = primals[0].le(primals[1]);
            Array::where_(
                &pick,
                &tan_or_zero(tangents[0], primals[0]),
                &tan_or_zero(tangents[1], primals[1]),
            )
        }
        Primitive::Max => {
            let pick = primals[0].ge(primals[1]);
            Array::where_(
                &pick,
                &tan_or_zero(tangents[0], primals[0]),
                &tan_or_zero(tangents[1], primals[1]),
            )
        }
        Primitive::Neg => tangents[0]?.neg(),
        Primitive::Abs => {
            let nonneg = primals[0].ge(&zero_like(primals[0]));
            let t = tangents[0]?;
            Array::where_(&nonneg, t, &t.neg())
        }
        Primitive::Exp => out.mul(tangents[0]?),
        Primitive::Log => tangents[0]?.div(primals[0]),
        Primitive::Sin => primals[0].cos().mul(tangents[0]?),
        Primitive::Cos => primals[0].sin().neg().mul(tangents[0]?),
        Primitive::Tan => {
            // t * (1 + tan(a)^2)
            tangents[0]?.mul(&out.mul(out).add_scalar(1.0))
        }
        Primitive::Atan => tangents[0]?.div(&primals[0].mul(primals[0]).add_scalar(1.0)),
        Primitive::Asin => {
            let denom = Array::ones(primals[0].shape(), primals[0].dtype())
                .sub(&primals[0].mul(primals[0]))
                .sqrt();
            tangents[0]?.div(&denom)
        }
        Primitive::Sqrt => tangents[0]?.div(&out.mul_scalar(2.0)),
        Primitive::Recip => out.mul(out).neg().mul(tangents[0]?),
        Primitive::Erf => {
            // d/dx erf = 2/sqrt(pi) * exp(-x^2)
            let coeff = primals[0].mul(primals[0]).neg().exp().mul_scalar(FRAC_2_SQRT_PI);
            coeff.mul(tangents[0]?)
        }
        Primitive::Erfc => {
            let coeff = primals[0].mul(primals[0]).neg().exp().mul_scalar(-FRAC_2_SQRT_PI);
            coeff.mul(tangents[0]?)
        }
        Primitive::Where => {
            let tx = tan_or_zero(tangents[1], primals[1]);
            let ty = tan_or_zero(tangents[2], primals[2]);
            Array::where_(primals[0], &tx, &ty)
        }
        Primitive::Cast(dtype) => {
            if primals[0].dtype().is_float() && dtype.is_float() {
                tangents[0]?.astype(*dtype)
            } else {
                return None;
            }
        }
        Primitive::Reduce { op: ReduceOp::Add, axis, keepdims } => {
            tangents[0]?.reduce_axis(ReduceOp::Add, *axis, *keepdims)
        }
        Primitive::Mean { axis, keepdims } => {
            tangents[0]?.mean(Some(*axis as isize), *keepdims)
        }
        Primitive::Reduce { op: ReduceOp::Mul, axis, keepdims } => {
            // sum over axis of (prod / a) * t
            let outk = keep_axis(out, primals[0], *axis, *keepdims);
            outk.div(primals[0])
                .mul(tangents[0]?)
                .reduce_axis(ReduceOp::Add, *axis, *keepdims)
        }
        Primitive::Reduce { op, axis, keepdims } => {
            // min/max: tangent flows from attaining elements
            let outk = keep_axis(out, primals[0], *axis, *keepdims);
            let mask = primals[0].eq(&outk);
            let masked = Array::where_(&mask, tangents[0]?, &zero_like(primals[0]));
            debug_assert!(matches!(op, ReduceOp::Min | ReduceOp::Max));
            masked.reduce_axis(ReduceOp::Add, *axis, *keepdims)
        }
        Primitive::Reshape(_)
        | Primitive::Transpose(_)
        | Primitive::Broadcast(_)
        | Primitive::Slice { .. }
        | Primitive::Flip(_)
        | Primitive::Pad(_) => {
            // Movement is linear: apply the same movement to the tangent.
            apply(prim, &[tangents[0]?])
        }
        Primitive::Eq
        | Primitive::Ne
        | Primitive::Lt
        | Primitive::Le
        | Primitive::Gt
        | Primitive::Ge
        | Primitive::RandomBits { .. }
        | Primitive::Routine(_) => return None,
    })
}

pub(crate) const FRAC_2_SQRT_PI: f64 = 1.128_379_167_095_512_6;

/// Re-insert a reduced axis so `out` broadcasts against the input.
pub(crate) fn keep_axis(out: &Array, input: &Array, axis: usize, keepdims: bool) -> Array {
    if keepdims {
        out.clone()
    } else {
        let mut shape: Vec<isize> = input.shape().iter().map(|&d| d as isize).collect();
        shape[axis] = 1;
        out.reshape(&shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jvp_product_rule() {
        // d(x*y) = y dx + x dy
        let f = |xs: &[Array]| vec![xs[0].mul(&xs[1])];
        let x = Array::from_vec(vec![2.0], &[1]);
        let y = Array::from_vec(vec![5.0], &[1]);
        let tx = Array::from_vec(vec![1.0], &[1]);
        let ty = Array::from_vec(vec![0.0], &[1]);
        let (_, dy) = jvp(f, &[x, y], &[tx, ty]);
        assert_eq!(dy[0].to_vec(), vec![5.0]);
    }

    #[test]
    fn test_jvp_chain_rule() {
        // d/dx sin(x^2) = 2x cos(x^2)
        let f = |xs: &[Array]| vec![xs[0].mul(&xs[0]).sin()];
        let x = Array::from_vec(vec![0.5], &[1]);
        let t = Array::from_vec(vec![1.0], &[1]);
        let (_, dy) = jvp(f, &[x], &[t]);
        let expected = 2.0 * 0.5 * (0.25f32).cos();
        assert!((dy[0].to_vec()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_jvp_reduction() {
        let f = |xs: &[Array]| vec![xs[0].sum(None, false)];
        let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        let t = Array::from_vec(vec![1.0, 10.0, 100.0], &[3]);
        let (y, dy) = jvp(f, &[x], &[t]);
        assert_eq!(y[0].to_vec(), vec![6.0]);
        assert_eq!(dy[0].to_vec(), vec![111.0]);
    }

    #[test]
    fn test_jvp_movement_is_linear() {
        let f = |xs: &[Array]| vec![xs[0].reshape(&[2, 2]).transpose(None).sum(Some(0), false)];
        let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[4]);
        let t = Array::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[4]);
        let (_, dy) = jvp(f, &[x], &[t]);
        // transpose([2,2]) then sum rows: tangent rows are [t00+t10, t01+t11]
        assert_eq!(dy[0].to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_jvp_finite_difference_agreement() {
        let f = |xs: &[Array]| vec![xs[0].exp().add(&xs[0].sin()).sum(None, false)];
        let x = Array::from_vec(vec![0.3, -0.7, 1.1], &[3]);
        let t = Array::from_vec(vec![1.0, 1.0, 1.0], &[3]);
        let (_, dy) = jvp(f, &[x.clone()], &[t.clone()]);

        let eps = 1e-3f32;
        let xp = x.add(&t.mul_scalar(eps as f64));
        let xm = x.sub(&t.mul_scalar(eps as f64));
        let fd = (f(&[xp])[0].to_vec()[0] - f(&[xm])[0].to_vec()[0]) / (2.0 * eps);
        assert!((dy[0].to_vec()[0] - fd).abs() < 1e-2);
    }
}

//! Gradient checks against central finite differences.

use approx::relative_eq;
use microjax::{grad, jvp, vjp, Array};

const EPS: f32 = 1e-3;
const TOL: f32 = 2e-2;

fn finite_difference(f: &dyn Fn(&Array) -> Array, x: &Array) -> Vec<f32> {
    let base = x.to_vec();
    let shape = x.shape().to_vec();
    (0..base.len())
        .map(|i| {
            let mut up = base.clone();
            let mut dn = base.clone();
            up[i] += EPS;
            dn[i] -= EPS;
            let fu = f(&Array::from_vec(up, &shape)).to_vec()[0];
            let fd = f(&Array::from_vec(dn, &shape)).to_vec()[0];
            (fu - fd) / (2.0 * EPS)
        })
        .collect()
}

fn check_grad(f: impl Fn(&Array) -> Array + Clone, x: Array, what: &str) {
    let analytic = grad(f.clone())(&x).to_vec();
    let numeric = finite_difference(&|a| f(a), &x);
    for (i, (&a, &n)) in analytic.iter().zip(&numeric).enumerate() {
        assert!(
            relative_eq!(a, n, epsilon = TOL, max_relative = TOL),
            "{}: component {}: analytic {} vs numeric {}",
            what,
            i,
            a,
            n
        );
    }
}

#[test]
fn test_grad_polynomial() {
    check_grad(
        |x: &Array| x.mul(x).mul(x).sum(None, false),
        Array::from_vec(vec![0.5, -1.2, 2.0], &[3]),
        "x^3",
    );
}

#[test]
fn test_grad_transcendentals() {
    check_grad(
        |x: &Array| x.exp().sum(None, false),
        Array::from_vec(vec![0.0, 0.5, -0.5], &[3]),
        "exp",
    );
    check_grad(
        |x: &Array| x.sin().sum(None, false),
        Array::from_vec(vec![0.3, 1.0, -2.0], &[3]),
        "sin",
    );
    check_grad(
        |x: &Array| x.log().sum(None, false),
        Array::from_vec(vec![0.5, 1.5, 3.0], &[3]),
        "log",
    );
    check_grad(
        |x: &Array| x.sqrt().sum(None, false),
        Array::from_vec(vec![0.5, 1.5, 4.0], &[3]),
        "sqrt",
    );
    check_grad(
        |x: &Array| x.erf().sum(None, false),
        Array::from_vec(vec![-0.8, 0.1, 1.4], &[3]),
        "erf",
    );
}

#[test]
fn test_grad_division_and_power() {
    check_grad(
        |x: &Array| x.reciprocal().sum(None, false),
        Array::from_vec(vec![1.0, 2.0, -3.0], &[3]),
        "1/x",
    );
    check_grad(
        |x: &Array| x.pow_scalar(3.0).sum(None, false),
        Array::from_vec(vec![0.7, 1.1, 2.2], &[3]),
        "x^3 via pow",
    );
}

#[test]
fn test_grad_through_matmul() {
    let b = Array::from_vec(vec![1.0, -2.0, 0.5, 3.0], &[2, 2]);
    check_grad(
        move |a: &Array| a.reshape(&[2, 2]).matmul(&b).sum(None, false),
        Array::from_vec(vec![0.1, 0.2, 0.3, 0.4], &[4]),
        "matmul",
    );
}

#[test]
fn test_grad_of_mean_and_min() {
    check_grad(
        |x: &Array| x.mean(None, false),
        Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[4]),
        "mean",
    );
    check_grad(
        |x: &Array| x.min(None, false),
        Array::from_vec(vec![3.0, 1.0, 2.0], &[3]),
        "min",
    );
}

#[test]
fn test_grad_of_where_composite() {
    // Softplus-like branchy function.
    check_grad(
        |x: &Array| {
            let zeros = Array::zeros(x.shape(), x.dtype());
            Array::where_(&x.gt(&zeros), x, &x.mul_scalar(0.1)).sum(None, false)
        },
        Array::from_vec(vec![-1.5, -0.2, 0.4, 2.0], &[4]),
        "leaky relu",
    );
}

#[test]
fn test_jvp_vjp_consistency() {
    // <J t, ct> == <t, J^T ct> for f: R^3 -> R^2
    let f = |xs: &[Array]| {
        let x = &xs[0];
        vec![Array::concatenate(
            &[&x.exp().sum(None, false).reshape(&[1]), &x.mul(x).sum(None, false).reshape(&[1])],
            0,
        )]
    };
    let x = Array::from_vec(vec![0.2, -0.4, 0.9], &[3]);
    let t = Array::from_vec(vec![1.0, 2.0, -1.0], &[3]);
    let ct = Array::from_vec(vec![0.3, -0.7], &[2]);

    let (_, jt) = jvp(f, &[x.clone()], &[t.clone()]);
    let lhs: f32 = jt[0].mul(&ct).sum(None, false).to_vec()[0];

    let (_, pullback) = vjp(f, &[x]);
    let jt_ct = pullback.call(&[ct]);
    let rhs: f32 = jt_ct[0].mul(&t).sum(None, false).to_vec()[0];

    assert!(
        relative_eq!(lhs, rhs, epsilon = 1e-4, max_relative = 1e-4),
        "{} vs {}",
        lhs,
        rhs
    );
}

#[test]
fn test_second_order_gradient() {
    // f(x) = sum(x^4); f'' diag = 12 x^2, probed via grad of sum(grad).
    let ddf = grad(|x: &Array| {
        let inner = grad(|y: &Array| y.mul(y).mul(y).mul(y).sum(None, false));
        inner(x).sum(None, false)
    });
    let x = Array::from_vec(vec![1.0, 2.0], &[2]);
    let got = ddf(&x).to_vec();
    assert!((got[0] - 12.0).abs() < 1e-3, "{:?}", got);
    assert!((got[1] - 48.0).abs() < 1e-2, "{:?}", got);
}

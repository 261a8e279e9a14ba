//! The jaxpr IR: a sequence of primitive equations recorded by tracing.

use crate::array::Array;
use crate::dtype::DType;
use crate::trace::primitive::{apply, Primitive};

/// Index of a traced variable. Invars occupy `0..num_inputs`; each equation
/// defines one fresh variable.
pub type VarId = usize;

/// Abstract value: shape and dtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aval {
    /// Shape
    pub shape: Vec<usize>,
    /// Dtype
    pub dtype: DType,
}

impl Aval {
    /// The aval of a concrete array.
    pub fn of(array: &Array) -> Aval {
        Aval { shape: array.shape().to_vec(), dtype: array.dtype() }
    }
}

/// An equation input: a traced variable or a captured constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atom {
    /// Reference to an invar or a previous equation's output
    Var(VarId),
    /// Index into the jaxpr's constant list
    Const(usize),
}

/// One primitive application.
#[derive(Debug, Clone)]
pub struct Eqn {
    /// The primitive
    pub prim: Primitive,
    /// Ordered inputs
    pub inputs: Vec<Atom>,
    /// The variable this equation defines
    pub output: VarId,
    /// Abstract value of the output
    pub aval: Aval,
}

/// A traced program: constants, inputs, equations, outputs.
///
/// The jaxpr owns its constant arrays (and thereby their buffers) for as
/// long as it lives; a jit cache entry holding a jaxpr keeps every captured
/// buffer alive until the entry is evicted.
#[derive(Debug, Clone)]
pub struct Jaxpr {
    /// Captured constant arrays
    pub consts: Vec<Array>,
    /// Number of invars (ids `0..num_inputs`)
    pub num_inputs: usize,
    /// Abstract values of the invars
    pub in_avals: Vec<Aval>,
    /// Equations in recorded order
    pub eqns: Vec<Eqn>,
    /// Outputs
    pub outvars: Vec<Atom>,
}

impl Jaxpr {
    /// Total number of variables (invars plus one per equation).
    pub fn var_count(&self) -> usize {
        self.num_inputs + self.eqns.len()
    }

    /// Resolve an atom against an environment and the constant list.
    pub(crate) fn resolve(&self, atom: Atom, env: &[Option<Array>]) -> Array {
        match atom {
            Atom::Var(v) => env[v].clone().expect("use of undefined jaxpr variable"),
            Atom::Const(c) => self.consts[c].clone(),
        }
    }

    /// Replay the equations in recorded order against concrete inputs.
    ///
    /// Operations stay lazy, so replaying re-fuses exactly as the original
    /// trace did.
    pub fn eval(&self, args: &[Array]) -> Vec<Array> {
        assert_eq!(args.len(), self.num_inputs, "jaxpr arity mismatch");
        for (a, aval) in args.iter().zip(&self.in_avals) {
            assert_eq!(a.shape(), &aval.shape[..], "jaxpr input shape mismatch");
            assert_eq!(a.dtype(), aval.dtype, "jaxpr input dtype mismatch");
        }
        let mut env: Vec<Option<Array>> = vec![None; self.var_count()];
        for (i, a) in args.iter().enumerate() {
            env[i] = Some(a.clone());
        }
        for eqn in &self.eqns {
            let inputs: Vec<Array> =
                eqn.inputs.iter().map(|&a| self.resolve(a, &env)).collect();
            let refs: Vec<&Array> = inputs.iter().collect();
            env[eqn.output] = Some(apply(&eqn.prim, &refs));
        }
        self.outvars.iter().map(|&a| self.resolve(a, &env)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::tracer::trace;

    #[test]
    fn test_trace_and_eval_roundtrip() {
        let f = |xs: &[Array]| vec![xs[0].add(&xs[1]).mul(&xs[0])];
        let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        let b = Array::from_vec(vec![3.0, 4.0], &[2]);
        let (outs, jaxpr) = trace("roundtrip", &f, &[a.clone(), b.clone()]);
        assert_eq!(outs[0].to_vec(), vec![4.0, 12.0]);
        assert_eq!(jaxpr.num_inputs, 2);
        assert_eq!(jaxpr.eqns.len(), 2);

        let replayed = jaxpr.eval(&[a, b]);
        assert_eq!(replayed[0].to_vec(), vec![4.0, 12.0]);
    }

    #[test]
    fn test_captured_constants() {
        let c = Array::from_vec(vec![10.0, 20.0], &[2]);
        let f = move |xs: &[Array]| vec![xs[0].add(&c)];
        let x = Array::from_vec(vec![1.0, 2.0], &[2]);
        let (_, jaxpr) = trace("consts", &f, &[x.clone()]);
        assert_eq!(jaxpr.consts.len(), 1);
        let replayed = jaxpr.eval(&[x]);
        assert_eq!(replayed[0].to_vec(), vec![11.0, 22.0]);
    }

    #[test]
    #[should_panic(expected = "shape mismatch")]
    fn test_eval_shape_mismatch_panics() {
        let f = |xs: &[Array]| vec![xs[0].neg()];
        let x = Array::from_vec(vec![1.0, 2.0], &[2]);
        let (_, jaxpr) = trace("shapes", &f, &[x]);
        jaxpr.eval(&[Array::from_vec(vec![1.0, 2.0, 3.0], &[3])]);
    }
}

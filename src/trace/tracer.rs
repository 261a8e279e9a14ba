//! The tracing interpreter stack.
//!
//! Transformations push a session onto a thread-local stack and call the
//! user function; every primitive application lands in the top session
//! (keyed by array id), building a jaxpr while the function executes
//! concretely. Arrays the session has never seen become captured constants.

use crate::array::Array;
use crate::trace::jaxpr::{Atom, Aval, Eqn, Jaxpr, VarId};
use crate::trace::primitive::Primitive;
use std::cell::RefCell;
use std::collections::HashMap;

struct TraceSession {
    name: String,
    var_of_array: HashMap<u64, Atom>,
    const_of_array: HashMap<u64, usize>,
    consts: Vec<Array>,
    in_avals: Vec<Aval>,
    eqns: Vec<Eqn>,
    next_var: VarId,
}

impl TraceSession {
    fn atom_for(&mut self, array: &Array) -> Atom {
        if let Some(&atom) = self.var_of_array.get(&array.id()) {
            return atom;
        }
        if let Some(&idx) = self.const_of_array.get(&array.id()) {
            return Atom::Const(idx);
        }
        // First sighting of an array created outside the trace: capture it.
        let idx = self.consts.len();
        self.consts.push(array.clone());
        self.const_of_array.insert(array.id(), idx);
        Atom::Const(idx)
    }

    fn record(&mut self, prim: Primitive, inputs: &[&Array], output: &Array) {
        let inputs: Vec<Atom> = inputs.iter().map(|a| self.atom_for(a)).collect();
        let var = self.next_var;
        self.next_var += 1;
        self.var_of_array.insert(output.id(), Atom::Var(var));
        self.eqns.push(Eqn { prim, inputs, output: var, aval: Aval::of(output) });
    }
}

thread_local! {
    static TRACE_STACK: RefCell<Vec<TraceSession>> = const { RefCell::new(Vec::new()) };
}

/// Record a primitive application into the innermost live session, if any.
pub(crate) fn record(prim: Primitive, inputs: &[&Array], output: &Array) {
    TRACE_STACK.with(|stack| {
        if let Some(top) = stack.borrow_mut().last_mut() {
            top.record(prim, inputs, output);
        }
    });
}

/// Whether a session is live on this thread.
pub fn is_tracing() -> bool {
    TRACE_STACK.with(|stack| !stack.borrow().is_empty())
}

/// Trace `f` over `args`, returning its (concrete) outputs and the recorded
/// jaxpr.
pub(crate) fn trace<F>(name: &str, f: &F, args: &[Array]) -> (Vec<Array>, Jaxpr)
where
    F: Fn(&[Array]) -> Vec<Array>,
{
    TRACE_STACK.with(|stack| {
        let mut session = TraceSession {
            name: name.to_string(),
            var_of_array: HashMap::new(),
            const_of_array: HashMap::new(),
            consts: Vec::new(),
            in_avals: args.iter().map(Aval::of).collect(),
            eqns: Vec::new(),
            next_var: args.len(),
        };
        for (i, a) in args.iter().enumerate() {
            session.var_of_array.insert(a.id(), Atom::Var(i));
        }
        stack.borrow_mut().push(session);
    });

    let outputs = f(args);

    TRACE_STACK.with(|stack| {
        let mut session = stack.borrow_mut().pop().expect("trace stack underflow");
        let outvars: Vec<Atom> = outputs.iter().map(|o| session.atom_for(o)).collect();
        log::debug!(
            "trace `{}`: {} eqns, {} consts, {} outputs",
            session.name,
            session.eqns.len(),
            session.consts.len(),
            outvars.len()
        );
        let jaxpr = Jaxpr {
            consts: session.consts,
            num_inputs: args.len(),
            in_avals: session.in_avals,
            eqns: session.eqns,
            outvars,
        };
        (outputs, jaxpr)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_tracing_scoped() {
        assert!(!is_tracing());
        let f = |xs: &[Array]| {
            assert!(is_tracing());
            vec![xs[0].neg()]
        };
        let x = Array::from_vec(vec![1.0], &[1]);
        trace("scoped", &f, &[x]);
        assert!(!is_tracing());
    }

    #[test]
    fn test_record_assigns_vars_in_order() {
        let f = |xs: &[Array]| {
            let a = xs[0].add(&xs[0]);
            let b = a.mul(&xs[0]);
            vec![b]
        };
        let x = Array::from_vec(vec![2.0], &[1]);
        let (_, jaxpr) = trace("vars", &f, &[x]);
        assert_eq!(jaxpr.eqns.len(), 2);
        assert_eq!(jaxpr.eqns[0].output, 1);
        assert_eq!(jaxpr.eqns[1].output, 2);
        assert_eq!(jaxpr.outvars, vec![Atom::Var(2)]);
    }

    #[test]
    fn test_constant_output_is_captured() {
        // A function ignoring its input still produces a valid jaxpr.
        let f = |_: &[Array]| vec![Array::from_vec(vec![7.0], &[1]).realize().unwrap()];
        let x = Array::from_vec(vec![1.0], &[1]);
        let (_, jaxpr) = trace("constout", &f, &[x.clone()]);
        assert_eq!(jaxpr.consts.len(), 1);
        let replayed = jaxpr.eval(&[x]);
        assert_eq!(replayed[0].to_vec(), vec![7.0]);
    }
}

//! Kernel fusion planning over a traced jaxpr.
//!
//! Consecutive element-wise equations with one output shape merge into a
//! group; a reduction of matching input shape joins as the group's tail and
//! closes it. Shape changes, movement equations, and routines break groups.
//! Each group corresponds to one fused kernel at execution time.

use crate::trace::jaxpr::Jaxpr;
use crate::trace::primitive::Primitive;

/// One fused group: equation indices, the common element-wise shape, and
/// the closing reduction's size (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct FusedGroup {
    /// Indices into `jaxpr.eqns`
    pub eqns: Vec<usize>,
    /// Common output shape of the element-wise body
    pub shape: Vec<usize>,
    /// Size of the closing reduction, when the group ends in one
    pub reduction: Option<usize>,
}

/// Partition a jaxpr's equations into fused groups.
pub fn plan(jaxpr: &Jaxpr) -> Vec<FusedGroup> {
    let mut groups: Vec<FusedGroup> = Vec::new();
    let mut current: Option<FusedGroup> = None;

    let input_shape = |idx: usize| -> Vec<usize> {
        let eqn = &jaxpr.eqns[idx];
        match eqn.inputs.first() {
            Some(crate::trace::jaxpr::Atom::Var(v)) if *v >= jaxpr.num_inputs => {
                jaxpr.eqns[v - jaxpr.num_inputs].aval.shape.clone()
            }
            Some(crate::trace::jaxpr::Atom::Var(v)) => jaxpr.in_avals[*v].shape.clone(),
            Some(crate::trace::jaxpr::Atom::Const(c)) => jaxpr.consts[*c].shape().to_vec(),
            None => Vec::new(),
        }
    };

    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        match &eqn.prim {
            p if p.is_elementwise() => {
                match &mut current {
                    Some(g) if g.shape == eqn.aval.shape => g.eqns.push(i),
                    Some(_) => {
                        groups.extend(current.take());
                        current = Some(FusedGroup {
                            eqns: vec![i],
                            shape: eqn.aval.shape.clone(),
                            reduction: None,
                        });
                    }
                    None => {
                        current = Some(FusedGroup {
                            eqns: vec![i],
                            shape: eqn.aval.shape.clone(),
                            reduction: None,
                        });
                    }
                }
            }
            Primitive::Reduce { axis, .. } | Primitive::Mean { axis, .. } => {
                let in_shape = input_shape(i);
                let rsize = in_shape.get(*axis).copied().unwrap_or(0);
                match current.take() {
                    // The reduction consumes the group's element-wise body.
                    Some(mut g) if g.shape == in_shape => {
                        g.eqns.push(i);
                        g.reduction = Some(rsize);
                        groups.push(g);
                    }
                    other => {
                        groups.extend(other);
                        groups.push(FusedGroup {
                            eqns: vec![i],
                            shape: in_shape,
                            reduction: Some(rsize),
                        });
                    }
                }
            }
            // Movement is free (tracker rewrites); routines and RNG break.
            Primitive::Reshape(_)
            | Primitive::Transpose(_)
            | Primitive::Broadcast(_)
            | Primitive::Slice { .. }
            | Primitive::Flip(_)
            | Primitive::Pad(_) => {}
            Primitive::RandomBits { .. } | Primitive::Routine(_) => {
                groups.extend(current.take());
            }
            _ => unreachable!(),
        }
    }
    groups.extend(current.take());

    log::debug!(
        "fusion: {} eqns -> {} groups ({} with reductions)",
        jaxpr.eqns.len(),
        groups.len(),
        groups.iter().filter(|g| g.reduction.is_some()).count()
    );
    groups
}

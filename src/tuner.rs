//! Kernel lowering plans.
//!
//! The tuner turns a [`Kernel`] into a [`Plan`]: a rewritten expression, an
//! output-index expression, a thread count, and the schedule dims (groups /
//! reduce / unroll / upcast). It chooses a schedule only: the numerical
//! result is identical to the null plan up to float reassociation in the
//! reduction loop.

use crate::alu::{AluExp, AluOp, Special};
use crate::kernel::Kernel;
use crate::tracker::ShapeTracker;
use std::collections::HashMap;

/// Schedule dimensions chosen by the tuner.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlanDims {
    /// Threads cooperating on one output via shared memory
    pub groups: usize,
    /// Reduction loop iterations per thread
    pub reduce: usize,
    /// Reduce elements folded per loop iteration (unrolled)
    pub unroll: usize,
    /// Output elements computed per thread
    pub upcast: usize,
}

/// A lowered kernel schedule.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Rewritten expression; `GlobalView` nodes are resolved to guarded
    /// `GlobalIndex` reads. Reads the specials `gidx` (thread id), `ridx`
    /// (loop counter), `unroll`, `upcast`, and `group` lanes.
    pub exp: AluExp,
    /// Flat output element index as a function of `gidx` and `upcast`
    pub output_index: AluExp,
    /// Total thread count: `(kernel.size / upcast) * groups`
    pub threads: usize,
    /// Schedule dims
    pub dims: PlanDims,
}

/// The null plan: one thread per output, plain reduction loop.
///
/// Used by the reference and bytecode backends, and as the GPU fallback.
pub fn null_plan(kernel: &Kernel) -> Plan {
    let reduce = kernel.reduction.as_ref().map(|r| r.size).unwrap_or(1);
    Plan {
        exp: resolve_views(&kernel.exp).simplify(),
        output_index: AluExp::special(Special::Gidx, kernel.size),
        threads: kernel.size,
        dims: PlanDims { groups: 1, reduce, unroll: 1, upcast: 1 },
    }
}

/// The heuristic GPU plan.
pub fn tuned_plan(kernel: &Kernel) -> Plan {
    let trackers = view_trackers(&kernel.exp);

    // All views must agree on the logical index shape, or we cannot reason
    // about axes at all.
    let ishape: Option<Vec<usize>> = match trackers.split_first() {
        None => None,
        Some((first, rest)) => {
            let s = first.shape().to_vec();
            if rest.iter().all(|t| t.shape() == s.as_slice()) {
                Some(s)
            } else {
                log::debug!("tuner: mixed index shapes, using null plan");
                return null_plan(kernel);
            }
        }
    };

    let rsize = kernel.reduction.as_ref().map(|r| r.size).unwrap_or(1);

    // The output axes: the common index shape minus the trailing reduction
    // axis, or the flat output when the kernel has no views.
    let out_shape: Vec<usize> = match &ishape {
        Some(s) if kernel.reduction.is_some() => {
            if s.last() != Some(&rsize) || s.iter().product::<usize>() != kernel.size * rsize {
                log::debug!("tuner: index shape does not factor into outputs x reduce");
                return null_plan(kernel);
            }
            s[..s.len() - 1].to_vec()
        }
        Some(s) => {
            if s.iter().product::<usize>() != kernel.size {
                return null_plan(kernel);
            }
            s.clone()
        }
        None => vec![kernel.size],
    };

    // --- Upcast: output axes with a stride-0 input, factors 4 then 3 ----
    let mut shrunk = out_shape.clone();
    let mut upcasts: Vec<(usize, usize)> = Vec::new(); // (axis, factor)
    let mut upcast = 1usize;
    while shrunk.iter().product::<usize>() >= 1024 && upcast < 16 {
        let mut best: Option<(usize, isize, usize, usize)> = None; // score tuple
        for axis in 0..shrunk.len() {
            for &factor in &[4usize, 3] {
                if shrunk[axis] % factor != 0 {
                    continue;
                }
                let strides: Vec<isize> =
                    trackers.iter().map(|t| t.last_strides()[axis]).collect();
                if !strides.iter().any(|&s| s == 0) {
                    continue;
                }
                let nonzero = strides.iter().filter(|&&s| s != 0).count();
                let sum: isize = strides.iter().map(|&s| s.abs()).sum();
                let score = (nonzero, sum, axis, factor);
                if best.map(|b| score < b).unwrap_or(true) {
                    best = Some(score);
                }
            }
        }
        let Some((_, _, axis, factor)) = best else { break };
        shrunk[axis] /= factor;
        upcasts.push((axis, factor));
        upcast *= factor;
    }

    // --- Unroll on the reduction axis -----------------------------------
    let unroll = if kernel.reduction.is_some() {
        if rsize % 4 == 0 && rsize >= 8 {
            4
        } else if rsize % 2 == 0 && rsize >= 4 {
            2
        } else {
            1
        }
    } else {
        1
    };

    // --- Group: long reductions with little output parallelism ----------
    let out_threads = kernel.size / upcast;
    let rleft = rsize / unroll;
    let groups = if kernel.reduction.is_some() {
        if out_threads < 64 && rleft % 64 == 0 && rleft >= 256 {
            64
        } else if out_threads < 128 && rleft % 32 == 0 && rleft >= 128 {
            32
        } else {
            1
        }
    } else {
        1
    };

    let reduce = rsize / (unroll * groups);
    let dims = PlanDims { groups, reduce, unroll, upcast };
    if kernel.reduction.is_some() {
        debug_assert_eq!(dims.reduce * dims.unroll * dims.groups, rsize);
    }

    // Rebuild the index specials: the original `gidx` ranged over outputs,
    // the original `ridx` over the whole reduction. Both become functions of
    // the scheduled lanes.
    let output_index = build_output_index(&out_shape, &shrunk, &upcasts, out_threads);
    let ridx_exp = if kernel.reduction.is_some() {
        // ridx = (r * groups + group) * unroll + unroll_lane, with the lane
        // terms present only when their factor is non-trivial.
        let mut ridx = AluExp::special(Special::Ridx, reduce);
        if groups > 1 {
            ridx = ridx
                .mul(&AluExp::i32(groups as i32))
                .add(&AluExp::special(Special::Group, groups));
        }
        if unroll > 1 {
            ridx = ridx
                .mul(&AluExp::i32(unroll as i32))
                .add(&AluExp::special(Special::Unroll, unroll));
        }
        ridx
    } else {
        AluExp::special(Special::Ridx, 1)
    };

    let mut subst = HashMap::new();
    subst.insert(Special::Gidx, output_index.clone());
    subst.insert(Special::Ridx, ridx_exp);
    let exp = resolve_views(&kernel.exp.substitute(&subst)).simplify();

    log::debug!(
        "tuner: size={} dims={:?} threads={}",
        kernel.size,
        dims,
        out_threads * groups
    );
    Plan { exp, output_index: output_index.simplify(), threads: out_threads * groups, dims }
}

/// Flat output index as a function of the thread id and the upcast lane.
fn build_output_index(
    out_shape: &[usize],
    shrunk: &[usize],
    upcasts: &[(usize, usize)],
    out_threads: usize,
) -> AluExp {
    let gidx = AluExp::special(Special::Gidx, out_threads.max(1));
    if upcasts.is_empty() {
        return gidx;
    }
    // Thread coords over the shrunk shape, upcast lane coords over factors.
    let coords = AluExp::unflatten(&gidx, shrunk);
    let factors: Vec<usize> = upcasts.iter().map(|&(_, f)| f).collect();
    let lane = AluExp::special(Special::Upcast, factors.iter().product());
    let lane_coords = AluExp::unflatten(&lane, &factors);

    // Reassemble the original coordinate of each axis.
    let mut full = coords;
    for (&(axis, factor), lc) in upcasts.iter().zip(lane_coords) {
        full[axis] = full[axis].mul(&AluExp::i32(factor as i32)).add(&lc);
    }
    AluExp::flatten(&full, out_shape)
}

/// Resolve every `GlobalView` through its tracker into a guarded
/// `GlobalIndex` read.
pub fn resolve_views(exp: &AluExp) -> AluExp {
    exp.rewrite(&|e| match e.op() {
        AluOp::GlobalView(gid, tracker) => {
            let (offset, valid) = tracker.to_alu_exp(e.src());
            let load = AluExp::global_index(e.dtype(), *gid, offset);
            match valid.op() {
                AluOp::Const(c) if c.as_bool() => Some(load),
                _ => Some(AluExp::select(
                    &valid,
                    &load,
                    &AluExp::constant(e.dtype(), crate::dtype::Scalar::zero(e.dtype())),
                )),
            }
        }
        _ => None,
    })
}

/// Collect the trackers of every `GlobalView` in the expression.
fn view_trackers(exp: &AluExp) -> Vec<ShapeTracker> {
    exp.collect(&|e| matches!(e.op(), AluOp::GlobalView(..)))
        .into_iter()
        .map(|e| match e.op() {
            AluOp::GlobalView(_, t) => t.clone(),
            _ => unreachable!(),
        })
        .collect()
}

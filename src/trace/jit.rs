//! Trace-compile-cache: `jit`.
//!
//! A jitted function traces once per input signature (shape, dtype,
//! device per leaf), runs the fuser over the recorded jaxpr, and caches the
//! result. Cache hits replay the equations in recorded order; laziness
//! re-fuses identically and the backends' executable caches make the
//! kernels free to re-prepare.

use crate::array::Array;
use crate::backend::Device;
use crate::dtype::DType;
use crate::trace::fusion;
use crate::trace::jaxpr::Jaxpr;
use crate::trace::tracer::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Signature = Vec<(Vec<usize>, DType, Device)>;

struct Compiled {
    jaxpr: Jaxpr,
    groups: Vec<fusion::FusedGroup>,
    warmed: usize,
}

/// A traced-and-cached function, returned by [`jit`].
pub struct JitFunction<F> {
    function: F,
    cache: Mutex<HashMap<Signature, Arc<Compiled>>>,
    name: String,
}

impl<F> JitFunction<F>
where
    F: Fn(&[Array]) -> Vec<Array>,
{
    fn signature(inputs: &[Array]) -> Signature {
        inputs.iter().map(|a| (a.shape().to_vec(), a.dtype(), a.device())).collect()
    }

    /// Execute, tracing and caching on the first call per signature.
    pub fn call(&self, inputs: &[Array]) -> Vec<Array> {
        // Under an enclosing trace (grad-of-jit, vmap-of-jit) the wrapper is
        // transparent: the outer transformation must see the primitives, not
        // an opaque cached program.
        if crate::trace::is_tracing() {
            return (self.function)(inputs);
        }
        let sig = Self::signature(inputs);
        let hit = self.cache.lock().unwrap().get(&sig).cloned();
        if let Some(compiled) = hit {
            log::trace!("jit `{}`: cache hit", self.name);
            return compiled.jaxpr.eval(inputs);
        }

        let (outputs, jaxpr) = trace(&self.name, &self.function, inputs);
        let groups = fusion::plan(&jaxpr);

        // Each fused group is one kernel. Realize the traced outputs (the
        // reductions already recorded their kernels during the trace) and
        // compile everything now: this call's dispatches and every replay
        // of structurally identical kernels hit the warm executable cache.
        let outputs: Vec<Array> = outputs
            .into_iter()
            .map(|o| o.realize().expect("jit output realization failed"))
            .collect();
        let mut warmed = 0;
        for out in &outputs {
            warmed += out.warm_pending().expect("jit kernel preparation failed");
        }

        log::debug!(
            "jit `{}`: compiled {} eqns into {} kernels ({} executables warmed)",
            self.name,
            jaxpr.eqns.len(),
            groups.len(),
            warmed
        );
        self.cache
            .lock()
            .unwrap()
            .insert(sig, Arc::new(Compiled { jaxpr, groups, warmed }));
        outputs
    }

    /// Number of cached signatures.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Number of fused kernels for a cached signature, if present.
    pub fn kernel_count(&self, inputs: &[Array]) -> Option<usize> {
        let sig = Self::signature(inputs);
        self.cache.lock().unwrap().get(&sig).map(|c| c.groups.len())
    }

    /// Number of executables compiled eagerly when a signature was first
    /// traced, if present.
    pub fn warmed_count(&self, inputs: &[Array]) -> Option<usize> {
        let sig = Self::signature(inputs);
        self.cache.lock().unwrap().get(&sig).map(|c| c.warmed)
    }
}

/// Trace-compile-cache a function.
///
/// # Examples
///
/// ```
/// # use microjax::{jit, Array};
/// let f = jit("double", |xs: &[Array]| vec![xs[0].add(&xs[0])]);
/// let x = Array::from_vec(vec![1.0, 2.0], &[2]);
/// assert_eq!(f.call(&[x])[0].to_vec(), vec![2.0, 4.0]);
/// ```
pub fn jit<F>(name: &str, function: F) -> JitFunction<F>
where
    F: Fn(&[Array]) -> Vec<Array>,
{
    JitFunction { function, cache: Mutex::new(HashMap::new()), name: name.to_string() }
}

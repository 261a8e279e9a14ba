//! The lazy array handle and its scheduler.
//!
//! An `Array` is a shape tracker over either a recorded ALU expression or a
//! realized device buffer, plus the set of pending executables that must run
//! before its data can be read. Element-wise operations fuse into one
//! expression; `realize` turns the recipe into a kernel dispatch.

use crate::alu::{AluExp, AluOp, Special};
use crate::backend::{self, Device, Executable};
use crate::buffer::{alloc_on, BufferHandle};
use crate::dtype::{DType, Scalar};
use crate::error::Result;
use crate::kernel::{Kernel, Reduction};
use crate::tracker::ShapeTracker;
use crate::Shape;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Fused expressions read at most this many distinct buffers; beyond it the
/// left operand is realized first.
const MAX_FUSED_INPUTS: usize = 8;

static ARRAY_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static PENDING_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_array_id() -> u64 {
    ARRAY_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A kernel dispatch that has been recorded but not necessarily submitted.
///
/// Holds a strong reference on every input and output buffer until it is
/// dropped after submission.
pub(crate) struct PendingExecute {
    pub(crate) kernel: Kernel,
    pub(crate) exe: Mutex<Option<Arc<dyn Executable>>>,
    pub(crate) inputs: Vec<BufferHandle>,
    pub(crate) outputs: Vec<BufferHandle>,
    pub(crate) submitted: AtomicBool,
    pub(crate) seq: u64,
}

impl PendingExecute {
    fn record(kernel: Kernel, inputs: Vec<BufferHandle>, outputs: Vec<BufferHandle>) -> Arc<Self> {
        Arc::new(PendingExecute {
            kernel,
            exe: Mutex::new(None),
            inputs,
            outputs,
            submitted: AtomicBool::new(false),
            seq: PENDING_SEQ.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }
}

/// Where an array's elements come from.
#[derive(Clone)]
pub(crate) enum Source {
    /// A recorded expression over `inputs` (gids are indices into it)
    Exp { exp: AluExp, inputs: Vec<BufferHandle> },
    /// A realized device buffer
    Buffer(BufferHandle),
}

/// A recipe: an expression plus the buffers its gids refer to.
pub(crate) struct Recipe {
    pub(crate) exp: AluExp,
    pub(crate) inputs: Vec<BufferHandle>,
}

/// A multidimensional lazy array.
///
/// Arrays are immutable; every operation returns a new handle. Clones are
/// cheap and share the underlying buffer reference.
#[derive(Clone)]
pub struct Array {
    device: Device,
    dtype: DType,
    tracker: ShapeTracker,
    source: Source,
    pending: Vec<Arc<PendingExecute>>,
    id: u64,
}

impl Array {
    // ---- internal constructors ----------------------------------------

    pub(crate) fn from_exp_parts(
        device: Device,
        dtype: DType,
        shape: &[usize],
        exp: AluExp,
        inputs: Vec<BufferHandle>,
        pending: Vec<Arc<PendingExecute>>,
    ) -> Array {
        debug_assert_eq!(exp.dtype(), dtype);
        Array {
            device,
            dtype,
            tracker: ShapeTracker::from_shape(shape),
            source: Source::Exp { exp, inputs },
            pending,
            id: next_array_id(),
        }
    }

    pub(crate) fn from_buffer_parts(
        buffer: BufferHandle,
        shape: &[usize],
        pending: Vec<Arc<PendingExecute>>,
    ) -> Array {
        Array {
            device: buffer.device(),
            dtype: buffer.dtype(),
            tracker: ShapeTracker::from_shape(shape),
            source: Source::Buffer(buffer),
            pending,
            id: next_array_id(),
        }
    }

    /// Same source, new tracker (movement ops).
    pub(crate) fn with_tracker(&self, tracker: ShapeTracker) -> Array {
        Array {
            device: self.device,
            dtype: self.dtype,
            tracker,
            source: self.source.clone(),
            pending: live_pending(&self.pending),
            id: next_array_id(),
        }
    }

    pub(crate) fn tracker(&self) -> &ShapeTracker {
        &self.tracker
    }

    // ---- accessors ----------------------------------------------------

    /// The logical shape as a slice.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.tracker.shape()
    }

    /// The logical shape as an owned [`Shape`].
    pub fn shape_obj(&self) -> Shape {
        Shape::new(self.shape().to_vec())
    }

    /// Element dtype.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Owning device.
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.tracker.ndim()
    }

    /// Total number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.tracker.size()
    }

    /// True for 0-dimensional arrays.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.ndim() == 0
    }

    /// Unique id of this handle, used by the tracer.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    // ---- recipes ------------------------------------------------------

    /// The expression producing the element at symbolic `indices`, plus the
    /// buffers it reads (gids local to the returned vec).
    pub(crate) fn recipe_at(&self, indices: &[AluExp]) -> Recipe {
        match &self.source {
            Source::Buffer(buf) => Recipe {
                exp: AluExp::global_view(
                    self.dtype,
                    0,
                    self.tracker.clone(),
                    indices.to_vec(),
                ),
                inputs: vec![buf.clone()],
            },
            Source::Exp { exp, inputs } => {
                let (offset, valid) = self.tracker.to_alu_exp(indices);
                let mut map = std::collections::HashMap::new();
                map.insert(Special::Gidx, offset);
                let body = exp.substitute(&map);
                let guarded = match valid.op() {
                    AluOp::Const(c) if c.as_bool() => body,
                    _ => AluExp::select(
                        &valid,
                        &body,
                        &AluExp::constant(self.dtype, Scalar::zero(self.dtype)),
                    ),
                };
                Recipe { exp: guarded, inputs: inputs.clone() }
            }
        }
    }

    /// Recipe over the flat output index (`gidx` in `0..size`).
    pub(crate) fn flat_recipe(&self) -> Recipe {
        if let Source::Exp { exp, inputs } = &self.source {
            if self.tracker.is_contiguous() {
                return Recipe { exp: exp.clone(), inputs: inputs.clone() };
            }
        }
        let gidx = AluExp::special(Special::Gidx, self.size());
        let indices = AluExp::unflatten(&gidx, self.shape());
        self.recipe_at(&indices)
    }

    /// Number of distinct buffers this array's recipe reads.
    pub(crate) fn input_count(&self) -> usize {
        match &self.source {
            Source::Exp { inputs, .. } => inputs.len(),
            Source::Buffer(_) => 1,
        }
    }

    /// Realize `self` if fusing `extra` more inputs would exceed the cap.
    pub(crate) fn realized_if_wide(&self, extra: usize) -> Array {
        let own = self.input_count();
        if own + extra > MAX_FUSED_INPUTS {
            self.realize().expect("realize failed")
        } else {
            self.clone()
        }
    }

    // ---- realization & readback ---------------------------------------

    /// Force this array to be backed by a contiguous buffer.
    ///
    /// Expression sources become one fused kernel; non-contiguous buffer
    /// views become a reindexing copy. Idempotent for contiguous buffers.
    /// The dispatch is recorded, not yet submitted.
    pub fn realize(&self) -> Result<Array> {
        if let Source::Buffer(_) = &self.source {
            if self.tracker.is_contiguous() {
                return Ok(self.clone());
            }
        }
        let recipe = self.flat_recipe();
        let kernel = Kernel {
            num_inputs: recipe.inputs.len(),
            size: self.size(),
            exp: recipe.exp.simplify(),
            reduction: None,
        };
        let backend = backend::backend(Some(self.device))?;
        let out = BufferHandle::alloc(backend, self.size(), self.dtype, None)?;
        let pe = PendingExecute::record(kernel, recipe.inputs, vec![out.clone()]);
        let mut pending = live_pending(&self.pending);
        pending.push(pe);
        Ok(Array::from_buffer_parts(out, self.shape(), pending))
    }

    /// Build a reduction kernel over the last axis of `self`.
    ///
    /// `self` must be arranged so the reduced axis is last; `out_shape` is
    /// the shape with that axis removed.
    pub(crate) fn reduce_last_axis(
        &self,
        op: crate::kernel::ReduceOp,
        out_shape: &[usize],
        epilogue: Option<AluExp>,
        out_dtype: DType,
    ) -> Result<Array> {
        let rsize = *self.shape().last().expect("reduction needs an axis");
        let out_size: usize = out_shape.iter().product();
        let gidx = AluExp::special(Special::Gidx, out_size);
        let mut indices = AluExp::unflatten(&gidx, out_shape);
        indices.push(AluExp::special(Special::Ridx, rsize));
        let recipe = self.recipe_at(&indices);
        let kernel = Kernel {
            num_inputs: recipe.inputs.len(),
            size: out_size,
            exp: recipe.exp.simplify(),
            reduction: Some(Reduction { op, size: rsize, fusion: epilogue }),
        };
        let backend = backend::backend(Some(self.device))?;
        let out = BufferHandle::alloc(backend, out_size, out_dtype, None)?;
        let pe = PendingExecute::record(kernel, recipe.inputs, vec![out.clone()]);
        let mut pending = live_pending(&self.pending);
        pending.push(pe);
        Ok(Array::from_buffer_parts(out, out_shape, pending))
    }

    /// Realize and synchronously submit every pending dispatch, returning a
    /// buffer-backed array with an empty pending set. Routines use this to
    /// get concrete input buffers.
    pub(crate) fn submitted(&self) -> Result<Array> {
        let realized = self.realize()?;
        let mut pend: Vec<Arc<PendingExecute>> =
            realized.pending.iter().filter(|p| !p.is_submitted()).cloned().collect();
        pend.sort_by_key(|p| p.seq);
        let backend = backend::backend(Some(realized.device))?;
        for p in &pend {
            let exe = match p.exe.lock().unwrap().clone() {
                Some(exe) => exe,
                None => backend.prepare(&p.kernel)?,
            };
            let inputs: Vec<_> = p.inputs.iter().map(|h| h.id()).collect();
            let outputs: Vec<_> = p.outputs.iter().map(|h| h.id()).collect();
            backend.dispatch(exe.as_ref(), &inputs, &outputs)?;
            p.submitted.store(true, Ordering::Release);
        }
        match &realized.source {
            Source::Buffer(buf) => {
                Ok(Array::from_buffer_parts(buf.clone(), realized.shape(), Vec::new()))
            }
            Source::Exp { .. } => unreachable!("realize returns buffers"),
        }
    }

    pub(crate) fn buffer(&self) -> Option<&BufferHandle> {
        match &self.source {
            Source::Buffer(buf) => Some(buf),
            Source::Exp { .. } => None,
        }
    }

    /// Compile every not-yet-prepared pending executable without
    /// dispatching, so later submission (and structurally identical
    /// replays) hit warm executable caches. Compiles overlap through the
    /// async prepare path. Returns how many kernels were prepared.
    pub(crate) fn warm_pending(&self) -> Result<usize> {
        let pend: Vec<Arc<PendingExecute>> = live_pending(&self.pending)
            .into_iter()
            .filter(|p| p.exe.lock().unwrap().is_none())
            .collect();
        if pend.is_empty() {
            return Ok(0);
        }
        let backend = backend::backend(Some(self.device))?;
        pollster::block_on(async {
            let prepares = pend
                .iter()
                .map(|p| backend.prepare_async(&p.kernel))
                .collect::<Vec<_>>();
            let compiled = futures::future::join_all(prepares).await;
            for (p, exe) in pend.iter().zip(compiled) {
                *p.exe.lock().unwrap() = Some(exe?);
            }
            Ok(pend.len())
        })
    }

    /// Realize, submit every pending dispatch in recorded order, and read
    /// back the buffer as host-layout bytes.
    pub async fn data_async(&self) -> Result<Vec<u8>> {
        let realized = self.realize()?;
        let mut pend: Vec<Arc<PendingExecute>> =
            realized.pending.iter().filter(|p| !p.is_submitted()).cloned().collect();
        pend.sort_by_key(|p| p.seq);
        pend.dedup_by_key(|p| p.seq);

        let backend = backend::backend(Some(realized.device))?;
        // Launch every outstanding compile up front so latency overlaps;
        // executables warmed earlier (by jit) are kept as-is.
        let unprepared: Vec<&Arc<PendingExecute>> =
            pend.iter().filter(|p| p.exe.lock().unwrap().is_none()).collect();
        let prepares = unprepared
            .iter()
            .map(|p| backend.prepare_async(&p.kernel))
            .collect::<Vec<_>>();
        let compiled = futures::future::join_all(prepares).await;
        for (p, exe) in unprepared.iter().zip(compiled) {
            *p.exe.lock().unwrap() = Some(exe?);
        }

        // Dispatch strictly in insertion order.
        for p in &pend {
            if p.is_submitted() {
                continue;
            }
            let exe = p.exe.lock().unwrap().clone().expect("prepared above");
            let inputs: Vec<_> = p.inputs.iter().map(|h| h.id()).collect();
            let outputs: Vec<_> = p.outputs.iter().map(|h| h.id()).collect();
            backend.dispatch(exe.as_ref(), &inputs, &outputs)?;
            p.submitted.store(true, Ordering::Release);
        }

        match &realized.source {
            Source::Buffer(buf) => buf.read(),
            Source::Exp { .. } => unreachable!("realize returns buffers"),
        }
    }

    /// Blocking form of [`Array::data_async`].
    pub fn data(&self) -> Result<Vec<u8>> {
        pollster::block_on(self.data_async())
    }

    /// Read back and convert every element to f32.
    ///
    /// # Panics
    ///
    /// Panics if a backend error surfaces during realization or readback.
    pub fn to_vec(&self) -> Vec<f32> {
        let bytes = self.data().expect("readback failed");
        (0..self.size())
            .map(|i| backend::read_scalar(&bytes, self.dtype, i as i64).as_f64() as f32)
            .collect()
    }

    /// Read back as f64 values.
    pub fn to_vec_f64(&self) -> Vec<f64> {
        let bytes = self.data().expect("readback failed");
        (0..self.size())
            .map(|i| backend::read_scalar(&bytes, self.dtype, i as i64).as_f64())
            .collect()
    }

    /// Read back as i32 values.
    ///
    /// # Panics
    ///
    /// Panics if the dtype is not Int32.
    pub fn to_vec_i32(&self) -> Vec<i32> {
        assert_eq!(self.dtype, DType::Int32, "to_vec_i32 requires Int32");
        let bytes = self.data().expect("readback failed");
        (0..self.size())
            .map(|i| backend::read_scalar(&bytes, self.dtype, i as i64).as_i64() as i32)
            .collect()
    }

    /// Read back as u32 values.
    ///
    /// # Panics
    ///
    /// Panics if the dtype is not Uint32.
    pub fn to_vec_u32(&self) -> Vec<u32> {
        assert_eq!(self.dtype, DType::Uint32, "to_vec_u32 requires Uint32");
        let bytes = self.data().expect("readback failed");
        (0..self.size())
            .map(|i| backend::read_scalar(&bytes, self.dtype, i as i64).as_i64() as u32)
            .collect()
    }

    /// Read back as booleans.
    ///
    /// # Panics
    ///
    /// Panics if the dtype is not Bool.
    pub fn to_bool_vec(&self) -> Vec<bool> {
        assert_eq!(self.dtype, DType::Bool, "to_bool_vec requires Bool");
        let bytes = self.data().expect("readback failed");
        (0..self.size())
            .map(|i| backend::read_scalar(&bytes, self.dtype, i as i64).as_bool())
            .collect()
    }

    /// Transfer to another device through a host copy.
    pub fn to_device(&self, device: Device) -> Result<Array> {
        if device == self.device {
            return Ok(self.clone());
        }
        let bytes = self.data()?;
        let buf = alloc_on(Some(device), self.size(), self.dtype, Some(&bytes))?;
        Ok(Array::from_buffer_parts(buf, self.shape(), Vec::new()))
    }
}

/// Union of pending sets, dropping already-submitted entries (the lazy,
/// monotonic drain).
pub(crate) fn live_pending(sets: &[Arc<PendingExecute>]) -> Vec<Arc<PendingExecute>> {
    let mut out: Vec<Arc<PendingExecute>> =
        sets.iter().filter(|p| !p.is_submitted()).cloned().collect();
    out.sort_by_key(|p| p.seq);
    out.dedup_by_key(|p| p.seq);
    out
}

/// Union of the pending sets of several arrays.
pub(crate) fn merge_pending(arrays: &[&Array]) -> Vec<Arc<PendingExecute>> {
    let mut all: Vec<Arc<PendingExecute>> = Vec::new();
    for a in arrays {
        all.extend(a.pending.iter().cloned());
    }
    live_pending(&all)
}

/// Remap the gids of `exp` so `extra` inputs can be appended after `base`,
/// deduplicating buffers shared between the two sides.
pub(crate) fn merge_recipes(base: &mut Vec<BufferHandle>, extra: Vec<BufferHandle>, exp: &AluExp) -> AluExp {
    let mut gid_map: Vec<usize> = Vec::with_capacity(extra.len());
    for handle in extra {
        let existing = base
            .iter()
            .position(|h| h.id() == handle.id() && h.device() == handle.device());
        match existing {
            Some(i) => gid_map.push(i),
            None => {
                base.push(handle);
                gid_map.push(base.len() - 1);
            }
        }
    }
    exp.rewrite(&|e| match e.op() {
        AluOp::GlobalIndex(gid) => Some(AluExp::global_index(
            e.dtype(),
            gid_map[*gid],
            e.src()[0].clone(),
        )),
        AluOp::GlobalView(gid, tracker) => Some(AluExp::global_view(
            e.dtype(),
            gid_map[*gid],
            tracker.clone(),
            e.src().to_vec(),
        )),
        _ => None,
    })
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array<{}>{}", self.dtype, self.shape_obj())
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array:{}{}", self.dtype, self.shape_obj())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_fusion_single_dispatch() {
        // (x + x) * (x - 1) on arange(8) builds exactly one kernel.
        let x = Array::arange(0.0, Some(8.0), 1.0, DType::Float32);
        let y = x.add(&x).mul(&x.sub_scalar(1.0));
        assert!(matches!(y.source, Source::Exp { .. }));
        assert!(y.pending.is_empty());

        let realized = y.realize().unwrap();
        assert_eq!(realized.pending.len(), 1);
        // 2x(x-1) over 0..8, with a signed zero up front.
        assert_eq!(
            y.to_vec(),
            vec![-0.0, 0.0, 4.0, 12.0, 24.0, 40.0, 60.0, 84.0]
        );
    }

    #[test]
    fn test_realize_idempotent() {
        let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        let r1 = x.realize().unwrap();
        let r2 = r1.realize().unwrap();
        // Same buffer, no new dispatch.
        match (&r1.source, &r2.source) {
            (Source::Buffer(a), Source::Buffer(b)) => assert_eq!(a.id(), b.id()),
            _ => panic!("expected buffers"),
        }
    }

    #[test]
    fn test_pending_drains_after_read() {
        let x = Array::arange(0.0, Some(4.0), 1.0, DType::Float32);
        let y = x.add(&x).realize().unwrap();
        assert!(!y.pending[0].is_submitted());
        let _ = y.to_vec();
        assert!(y.pending[0].is_submitted());
        // Downstream arrays drop the submitted entry.
        let z = y.add(&y);
        assert!(z.pending.is_empty());
    }

    #[test]
    fn test_refcount_law() {
        let backend = backend::backend(Some(Device::Cpu)).unwrap();
        let before = backend.allocated();
        {
            let x = Array::from_vec(vec![1.0, 2.0], &[2]);
            let y = x.add(&x);
            let _ = y.to_vec();
        }
        assert_eq!(backend.allocated(), before);
    }

    #[test]
    fn test_to_device_roundtrip() {
        let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3]);
        let w = x.to_device(Device::Wasm).unwrap();
        assert_eq!(w.device(), Device::Wasm);
        assert_eq!(w.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_shared_input_dedup() {
        // x appears on both sides; the fused kernel reads it once.
        let x = Array::from_vec(vec![1.0, 2.0], &[2]);
        let y = x.add(&x);
        if let Source::Exp { inputs, .. } = &y.source {
            assert_eq!(inputs.len(), 1);
        } else {
            panic!("expected fused expression");
        }
    }
}

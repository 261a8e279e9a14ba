//! Reference backend: host buffers, tree-walking evaluation.
//!
//! Dispatch loops over every output element and evaluates the plan
//! expression directly. Slow, but it defines the semantics the other
//! backends are tested against.

use crate::alu::{self, AluOp, EvalEnv, Special};
use crate::backend::{read_scalar, write_scalar, Backend, BufferId, Device, Executable};
use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::tuner::{null_plan, Plan};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Entry {
    refcount: usize,
    dtype: DType,
    len: usize,
    data: Vec<u8>,
}

/// The reference interpreter backend.
pub struct CpuBackend {
    table: Mutex<HashMap<BufferId, Entry>>,
    programs: Mutex<HashMap<u64, Arc<CpuExecutable>>>,
    next_id: AtomicU64,
}

struct CpuExecutable {
    kernel: Kernel,
    plan: Plan,
}

impl Executable for CpuExecutable {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl CpuBackend {
    pub(crate) fn new() -> CpuBackend {
        CpuBackend {
            table: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Backend for CpuBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn malloc(&self, len: usize, dtype: DType, init: Option<&[u8]>) -> Result<BufferId> {
        let bytes = len * dtype.byte_width();
        let data = match init {
            Some(src) => {
                assert_eq!(src.len(), bytes, "init length mismatch");
                src.to_vec()
            }
            None => vec![0u8; bytes],
        };
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .lock()
            .unwrap()
            .insert(id, Entry { refcount: 1, dtype, len, data });
        Ok(id)
    }

    fn inc_ref(&self, id: BufferId) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let entry = table.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        entry.refcount += 1;
        Ok(())
    }

    fn dec_ref(&self, id: BufferId) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let entry = table.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            table.remove(&id);
        }
        Ok(())
    }

    fn read(&self, id: BufferId, start: usize, count: Option<usize>) -> Result<Vec<u8>> {
        let table = self.table.lock().unwrap();
        let entry = table.get(&id).ok_or(Error::InvalidHandle(id))?;
        let count = count.unwrap_or(entry.len.saturating_sub(start));
        let w = entry.dtype.byte_width();
        Ok(entry.data[start * w..(start + count) * w].to_vec())
    }

    fn prepare(&self, kernel: &Kernel) -> Result<Arc<dyn Executable>> {
        let key = kernel.cache_key();
        let mut programs = self.programs.lock().unwrap();
        if let Some(exe) = programs.get(&key) {
            return Ok(exe.clone() as Arc<dyn Executable>);
        }
        let exe = Arc::new(CpuExecutable { kernel: kernel.clone(), plan: null_plan(kernel) });
        programs.insert(key, exe.clone());
        Ok(exe)
    }

    fn dispatch(
        &self,
        exe: &dyn Executable,
        inputs: &[BufferId],
        outputs: &[BufferId],
    ) -> Result<()> {
        let exe = exe
            .as_any()
            .downcast_ref::<CpuExecutable>()
            .expect("executable from a different backend");
        let kernel = &exe.kernel;
        assert_eq!(inputs.len(), kernel.num_inputs, "input arity mismatch");
        assert_eq!(outputs.len(), 1, "kernels have one output");

        let mut table = self.table.lock().unwrap();
        let out_dtype = kernel.dtype();
        let mut out_data = {
            let entry = table.get_mut(&outputs[0]).ok_or(Error::InvalidHandle(outputs[0]))?;
            std::mem::take(&mut entry.data)
        };
        {
            let input_entries: Vec<(&[u8], DType)> = inputs
                .iter()
                .map(|id| {
                    let e = table.get(id).ok_or(Error::InvalidHandle(*id))?;
                    Ok((&e.data[..], e.dtype))
                })
                .collect::<Result<_>>()?;
            let globals = |gid: usize, idx: i64| -> Scalar {
                let (bytes, dtype) = input_entries[gid];
                read_scalar(bytes, dtype, idx)
            };

            let mut specials: HashMap<Special, Scalar> = HashMap::new();
            for i in 0..kernel.size {
                specials.insert(Special::Gidx, Scalar::I32(i as i32));
                let value = match &kernel.reduction {
                    None => {
                        let env = EvalEnv { specials: &specials, globals: &globals };
                        exe.plan.exp.evaluate(&env)
                    }
                    Some(red) => {
                        let body_dtype = exe.plan.exp.dtype();
                        let mut acc = red.op.identity(body_dtype);
                        for r in 0..red.size {
                            specials.insert(Special::Ridx, Scalar::I32(r as i32));
                            let env = EvalEnv { specials: &specials, globals: &globals };
                            let v = exe.plan.exp.evaluate(&env);
                            acc = alu::eval_binary(&reduce_alu_op(red.op), body_dtype, acc, v);
                        }
                        match &red.fusion {
                            Some(epilogue) => {
                                specials.insert(Special::Acc, acc);
                                let env = EvalEnv { specials: &specials, globals: &globals };
                                epilogue.evaluate(&env)
                            }
                            None => acc,
                        }
                    }
                };
                write_scalar(&mut out_data, out_dtype, i, value);
            }
        }
        table.get_mut(&outputs[0]).unwrap().data = out_data;
        Ok(())
    }

    fn allocated(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

fn reduce_alu_op(op: crate::kernel::ReduceOp) -> AluOp {
    match op {
        crate::kernel::ReduceOp::Add => AluOp::Add,
        crate::kernel::ReduceOp::Mul => AluOp::Mul,
        crate::kernel::ReduceOp::Min => AluOp::Min,
        crate::kernel::ReduceOp::Max => AluOp::Max,
    }
}

//! Bytecode backend: a minimal stack machine with an f32/i32/u32 ALU.
//!
//! `prepare` assembles the kernel's expression into a compact typed
//! bytecode program; `dispatch` runs the program once per output element
//! over host-memory buffers. Transcendentals are software polynomial
//! approximations with documented error bounds, and the Threefry PRNG
//! lives here as well.

use crate::alu::{AluExp, AluOp, Special};
use crate::backend::{read_scalar, write_scalar, Backend, BufferId, Device, Executable};
use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, ReduceOp};
use crate::tuner::null_plan;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Register type of the stack machine. Bool rides in `I32`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NumTy {
    F32,
    I32,
    U32,
}

fn numty(dtype: DType) -> Result<NumTy> {
    match dtype {
        DType::Bool | DType::Int32 => Ok(NumTy::I32),
        DType::Uint32 => Ok(NumTy::U32),
        DType::Float16 | DType::Float32 => Ok(NumTy::F32),
        DType::Float64 => Err(Error::Unsupported {
            device: Device::Wasm,
            what: "float64 is outside the f32/i32/u32 ALU".into(),
        }),
    }
}

/// One stack-machine instruction.
#[derive(Debug, Copy, Clone)]
enum Insn {
    ConstF32(f32),
    ConstI32(i32),
    ConstU32(u32),
    /// Push a special register (gidx / ridx / acc).
    Push(Special),
    /// Pop an i32 index, push the element of input `gid`.
    Load(usize, DType),

    Add(NumTy),
    Sub(NumTy),
    Mul(NumTy),
    Div(NumTy),
    IDiv(NumTy),
    Mod(NumTy),
    Min(NumTy),
    Max(NumTy),
    Pow,
    Neg(NumTy),
    Recip,
    Sqrt,
    Abs(NumTy),
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Atan,
    Asin,
    Erf,
    Erfc,
    /// Comparison; pushes 0/1 as i32.
    Cmp(CmpOp, NumTy),
    /// Pop cond (i32), y, x; push x if cond != 0 else y.
    Select,
    Cast(NumTy, NumTy),
    /// Narrow through f16 precision.
    DemoteF16,
}

#[derive(Debug, Copy, Clone)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Raw stack slot.
#[derive(Debug, Copy, Clone)]
enum Slot {
    F32(f32),
    I32(i32),
    U32(u32),
}

impl Slot {
    fn f32(self) -> f32 {
        match self {
            Slot::F32(v) => v,
            Slot::I32(v) => v as f32,
            Slot::U32(v) => v as f32,
        }
    }
    fn i32(self) -> i32 {
        match self {
            Slot::F32(v) => v as i32,
            Slot::I32(v) => v,
            Slot::U32(v) => v as i32,
        }
    }
    fn u32(self) -> u32 {
        match self {
            Slot::F32(v) => v as u32,
            Slot::I32(v) => v as u32,
            Slot::U32(v) => v,
        }
    }
}

/// An assembled program: the kernel body plus an optional epilogue.
struct Program {
    body: Vec<Insn>,
    epilogue: Option<Vec<Insn>>,
    max_stack: usize,
}

struct WasmExecutable {
    kernel: Kernel,
    program: Program,
}

impl Executable for WasmExecutable {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

struct Assembler {
    code: Vec<Insn>,
    depth: usize,
    max_depth: usize,
}

impl Assembler {
    fn new() -> Assembler {
        Assembler { code: Vec::new(), depth: 0, max_depth: 0 }
    }

    fn emit(&mut self, insn: Insn, pops: usize, pushes: usize) {
        debug_assert!(self.depth >= pops, "stack underflow in assembler");
        self.depth = self.depth - pops + pushes;
        self.max_depth = self.max_depth.max(self.depth);
        self.code.push(insn);
    }

    fn assemble(&mut self, exp: &AluExp) -> Result<()> {
        let ty = numty(exp.dtype())?;
        match exp.op() {
            AluOp::Const(c) => {
                let insn = match ty {
                    NumTy::F32 => Insn::ConstF32(c.as_f64() as f32),
                    NumTy::I32 => Insn::ConstI32(c.cast(DType::Int32).as_i64() as i32),
                    NumTy::U32 => Insn::ConstU32(c.cast(DType::Uint32).as_i64() as u32),
                };
                self.emit(insn, 0, 1);
            }
            AluOp::Special(kind, _) => self.emit(Insn::Push(*kind), 0, 1),
            AluOp::GlobalIndex(gid) => {
                self.assemble(&exp.src()[0])?;
                self.emit(Insn::Load(*gid, exp.dtype()), 1, 1);
            }
            AluOp::GlobalView(..) => {
                return Err(Error::Unsupported {
                    device: Device::Wasm,
                    what: "unlowered global view reached the assembler".into(),
                })
            }
            AluOp::Where => {
                self.assemble(&exp.src()[1])?;
                self.assemble(&exp.src()[2])?;
                self.assemble(&exp.src()[0])?;
                self.emit(Insn::Select, 3, 1);
            }
            AluOp::Cast => {
                let from = numty(exp.src()[0].dtype())?;
                self.assemble(&exp.src()[0])?;
                if from != ty {
                    self.emit(Insn::Cast(from, ty), 1, 1);
                }
                if exp.dtype() == DType::Float16 {
                    self.emit(Insn::DemoteF16, 1, 1);
                }
            }
            AluOp::CmpEq | AluOp::CmpNe | AluOp::CmpLt | AluOp::CmpLe | AluOp::CmpGt
            | AluOp::CmpGe => {
                let operand_ty = numty(exp.src()[0].dtype())?;
                self.assemble(&exp.src()[0])?;
                self.assemble(&exp.src()[1])?;
                let cmp = match exp.op() {
                    AluOp::CmpEq => CmpOp::Eq,
                    AluOp::CmpNe => CmpOp::Ne,
                    AluOp::CmpLt => CmpOp::Lt,
                    AluOp::CmpLe => CmpOp::Le,
                    AluOp::CmpGt => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                self.emit(Insn::Cmp(cmp, operand_ty), 2, 1);
            }
            op if exp.src().len() == 2 => {
                self.assemble(&exp.src()[0])?;
                self.assemble(&exp.src()[1])?;
                let insn = match op {
                    AluOp::Add => Insn::Add(ty),
                    AluOp::Sub => Insn::Sub(ty),
                    AluOp::Mul => Insn::Mul(ty),
                    AluOp::Div => Insn::Div(ty),
                    AluOp::IDiv => Insn::IDiv(ty),
                    AluOp::Mod => Insn::Mod(ty),
                    AluOp::Min => Insn::Min(ty),
                    AluOp::Max => Insn::Max(ty),
                    AluOp::Pow => Insn::Pow,
                    _ => unreachable!("binary op {:?}", op),
                };
                self.emit(insn, 2, 1);
            }
            op => {
                self.assemble(&exp.src()[0])?;
                let insn = match op {
                    AluOp::Neg => Insn::Neg(ty),
                    AluOp::Recip => Insn::Recip,
                    AluOp::Sqrt => Insn::Sqrt,
                    AluOp::Abs => Insn::Abs(ty),
                    AluOp::Exp => Insn::Exp,
                    AluOp::Log => Insn::Log,
                    AluOp::Sin => Insn::Sin,
                    AluOp::Cos => Insn::Cos,
                    AluOp::Tan => Insn::Tan,
                    AluOp::Atan => Insn::Atan,
                    AluOp::Asin => Insn::Asin,
                    AluOp::Erf => Insn::Erf,
                    AluOp::Erfc => Insn::Erfc,
                    _ => unreachable!("unary op {:?}", op),
                };
                self.emit(insn, 1, 1);
            }
        }
        // f16 arithmetic results narrow after every operation.
        if exp.dtype() == DType::Float16
            && !matches!(exp.op(), AluOp::Cast | AluOp::Const(_) | AluOp::GlobalIndex(_))
        {
            self.emit(Insn::DemoteF16, 1, 1);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

struct Vm<'a> {
    stack: Vec<Slot>,
    inputs: &'a [(&'a [u8], DType)],
}

impl<'a> Vm<'a> {
    fn run(&mut self, code: &[Insn], gidx: i32, ridx: i32, acc: Slot) -> Slot {
        self.stack.clear();
        for insn in code {
            match *insn {
                Insn::ConstF32(v) => self.stack.push(Slot::F32(v)),
                Insn::ConstI32(v) => self.stack.push(Slot::I32(v)),
                Insn::ConstU32(v) => self.stack.push(Slot::U32(v)),
                Insn::Push(Special::Gidx) => self.stack.push(Slot::I32(gidx)),
                Insn::Push(Special::Ridx) => self.stack.push(Slot::I32(ridx)),
                Insn::Push(Special::Acc) => self.stack.push(acc),
                Insn::Push(kind) => panic!("special `{}` in bytecode", kind.name()),
                Insn::Load(gid, dtype) => {
                    let idx = self.pop().i32() as i64;
                    let (bytes, _) = self.inputs[gid];
                    let v = read_scalar(bytes, dtype, idx);
                    self.stack.push(match v {
                        Scalar::Bool(b) => Slot::I32(b as i32),
                        Scalar::I32(x) => Slot::I32(x),
                        Scalar::U32(x) => Slot::U32(x),
                        Scalar::F32(x) => Slot::F32(x),
                        Scalar::F64(x) => Slot::F32(x as f32),
                    });
                }
                Insn::Select => {
                    let cond = self.pop().i32();
                    let y = self.pop();
                    let x = self.pop();
                    self.stack.push(if cond != 0 { x } else { y });
                }
                Insn::Cast(_, to) => {
                    let v = self.pop();
                    self.stack.push(match to {
                        NumTy::F32 => Slot::F32(v.f32()),
                        NumTy::I32 => Slot::I32(v.i32()),
                        NumTy::U32 => Slot::U32(v.u32()),
                    });
                }
                Insn::DemoteF16 => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(half::f16::from_f32(v).to_f32()));
                }
                Insn::Cmp(cmp, ty) => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = match ty {
                        NumTy::F32 => compare(cmp, a.f32().partial_cmp(&b.f32())),
                        NumTy::I32 => compare(cmp, Some(a.i32().cmp(&b.i32()))),
                        NumTy::U32 => compare(cmp, Some(a.u32().cmp(&b.u32()))),
                    };
                    self.stack.push(Slot::I32(r as i32));
                }
                Insn::Pow => {
                    let b = self.pop().f32();
                    let a = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::exp(b * softmath::log(a))));
                }
                Insn::Recip => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(1.0 / v));
                }
                Insn::Sqrt => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(v.sqrt()));
                }
                Insn::Exp => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::exp(v)));
                }
                Insn::Log => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::log(v)));
                }
                Insn::Sin => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::sin(v)));
                }
                Insn::Cos => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::cos(v)));
                }
                Insn::Tan => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::sin(v) / softmath::cos(v)));
                }
                Insn::Atan => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::atan(v)));
                }
                Insn::Asin => {
                    let v = self.pop().f32();
                    // asin(x) = atan(x / sqrt(1 - x^2))
                    self.stack
                        .push(Slot::F32(softmath::atan(v / (1.0 - v * v).sqrt())));
                }
                Insn::Erf => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::erf(v)));
                }
                Insn::Erfc => {
                    let v = self.pop().f32();
                    self.stack.push(Slot::F32(softmath::erfc(v)));
                }
                Insn::Neg(ty) => {
                    let v = self.pop();
                    self.stack.push(match ty {
                        NumTy::F32 => Slot::F32(-v.f32()),
                        NumTy::I32 => Slot::I32(v.i32().wrapping_neg()),
                        NumTy::U32 => Slot::U32(v.u32().wrapping_neg()),
                    });
                }
                Insn::Abs(ty) => {
                    let v = self.pop();
                    self.stack.push(match ty {
                        NumTy::F32 => Slot::F32(v.f32().abs()),
                        NumTy::I32 => Slot::I32(v.i32().wrapping_abs()),
                        NumTy::U32 => v,
                    });
                }
                Insn::Add(ty) => self.arith(ty, |a, b| a + b, i32::wrapping_add, u32::wrapping_add),
                Insn::Sub(ty) => self.arith(ty, |a, b| a - b, i32::wrapping_sub, u32::wrapping_sub),
                Insn::Mul(ty) => self.arith(ty, |a, b| a * b, i32::wrapping_mul, u32::wrapping_mul),
                Insn::Div(ty) => self.arith(ty, |a, b| a / b, i32::div_euclid, |a, b| a / b),
                Insn::IDiv(ty) => {
                    self.arith(ty, |a, b| (a / b).floor(), i32::div_euclid, |a, b| a / b)
                }
                Insn::Mod(ty) => self.arith(ty, |a, b| a % b, i32::rem_euclid, |a, b| a % b),
                Insn::Min(ty) => self.arith(ty, f32::min, i32::min, u32::min),
                Insn::Max(ty) => self.arith(ty, f32::max, i32::max, u32::max),
            }
        }
        self.pop()
    }

    fn pop(&mut self) -> Slot {
        self.stack.pop().expect("stack underflow")
    }

    fn arith(
        &mut self,
        ty: NumTy,
        f: impl Fn(f32, f32) -> f32,
        i: impl Fn(i32, i32) -> i32,
        u: impl Fn(u32, u32) -> u32,
    ) {
        let b = self.pop();
        let a = self.pop();
        self.stack.push(match ty {
            NumTy::F32 => Slot::F32(f(a.f32(), b.f32())),
            NumTy::I32 => Slot::I32(i(a.i32(), b.i32())),
            NumTy::U32 => Slot::U32(u(a.u32(), b.u32())),
        });
    }
}

fn compare(op: CmpOp, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ord == Some(Equal),
        CmpOp::Ne => ord != Some(Equal),
        CmpOp::Lt => ord == Some(Less),
        CmpOp::Le => matches!(ord, Some(Less) | Some(Equal)),
        CmpOp::Gt => ord == Some(Greater),
        CmpOp::Ge => matches!(ord, Some(Greater) | Some(Equal)),
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct Entry {
    refcount: usize,
    dtype: DType,
    len: usize,
    data: Vec<u8>,
}

/// The bytecode stack-machine backend.
pub struct WasmBackend {
    table: Mutex<HashMap<BufferId, Entry>>,
    programs: Mutex<HashMap<u64, Arc<WasmExecutable>>>,
    next_id: AtomicU64,
}

impl WasmBackend {
    pub(crate) fn new() -> WasmBackend {
        WasmBackend {
            table: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Backend for WasmBackend {
    fn device(&self) -> Device {
        Device::Wasm
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
        if let Some(exe) = self.programs.lock().unwrap().get(&key) {
            return Ok(exe.clone() as Arc<dyn Executable>);
        }
        let plan = null_plan(kernel);
        let mut asm = Assembler::new();
        asm.assemble(&plan.exp)?;
        let body = std::mem::take(&mut asm.code);
        let body_max = asm.max_depth;

        let epilogue = match kernel.reduction.as_ref().and_then(|r| r.fusion.as_ref()) {
            Some(f) => {
                let mut easm = Assembler::new();
                easm.assemble(f)?;
                Some(easm.code)
            }
            None => None,
        };
        log::trace!("wasm: assembled {} insns for kernel {:x}", body.len(), key);

        let exe = Arc::new(WasmExecutable {
            kernel: kernel.clone(),
            program: Program { body, epilogue, max_stack: body_max },
        });
        self.programs.lock().unwrap().insert(key, exe.clone());
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
            .downcast_ref::<WasmExecutable>()
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
            let mut vm = Vm {
                stack: Vec::with_capacity(exe.program.max_stack.max(4)),
                inputs: &input_entries,
            };

            for i in 0..kernel.size {
                let value = match &kernel.reduction {
                    None => vm.run(&exe.program.body, i as i32, 0, Slot::I32(0)),
                    Some(red) => {
                        let body_ty = numty(exe.plan_body_dtype())?;
                        let mut acc = identity_slot(red.op, body_ty);
                        for r in 0..red.size {
                            let v = vm.run(&exe.program.body, i as i32, r as i32, Slot::I32(0));
                            acc = fold_slot(red.op, body_ty, acc, v);
                        }
                        match &exe.program.epilogue {
                            Some(code) => vm.run(code, i as i32, 0, acc),
                            None => acc,
                        }
                    }
                };
                let scalar = match (out_dtype, value) {
                    (DType::Bool, s) => Scalar::Bool(s.i32() != 0),
                    (DType::Int32, s) => Scalar::I32(s.i32()),
                    (DType::Uint32, s) => Scalar::U32(s.u32()),
                    (_, s) => Scalar::F32(s.f32()),
                };
                write_scalar(&mut out_data, out_dtype, i, scalar);
            }
        }
        table.get_mut(&outputs[0]).unwrap().data = out_data;
        Ok(())
    }

    fn allocated(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

impl WasmExecutable {
    fn plan_body_dtype(&self) -> DType {
        self.kernel.exp.dtype()
    }
}

fn identity_slot(op: ReduceOp, ty: NumTy) -> Slot {
    let dtype = match ty {
        NumTy::F32 => DType::Float32,
        NumTy::I32 => DType::Int32,
        NumTy::U32 => DType::Uint32,
    };
    match op.identity(dtype) {
        Scalar::F32(v) => Slot::F32(v),
        Scalar::I32(v) => Slot::I32(v),
        Scalar::U32(v) => Slot::U32(v),
        Scalar::Bool(b) => Slot::I32(b as i32),
        Scalar::F64(v) => Slot::F32(v as f32),
    }
}

fn fold_slot(op: ReduceOp, ty: NumTy, acc: Slot, v: Slot) -> Slot {
    match ty {
        NumTy::F32 => {
            let (a, b) = (acc.f32(), v.f32());
            Slot::F32(match op {
                ReduceOp::Add => a + b,
                ReduceOp::Mul => a * b,
                ReduceOp::Min => a.min(b),
                ReduceOp::Max => a.max(b),
            })
        }
        NumTy::I32 => {
            let (a, b) = (acc.i32(), v.i32());
            Slot::I32(match op {
                ReduceOp::Add => a.wrapping_add(b),
                ReduceOp::Mul => a.wrapping_mul(b),
                ReduceOp::Min => a.min(b),
                ReduceOp::Max => a.max(b),
            })
        }
        NumTy::U32 => {
            let (a, b) = (acc.u32(), v.u32());
            Slot::U32(match op {
                ReduceOp::Add => a.wrapping_add(b),
                ReduceOp::Mul => a.wrapping_mul(b),
                ReduceOp::Min => a.min(b),
                ReduceOp::Max => a.max(b),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Software math
// ---------------------------------------------------------------------------

/// Software transcendentals and the Threefry PRNG.
///
/// Polynomial approximations in the Cephes style. Documented bounds:
/// `exp` rel < 2e-7, `log` rel < 5e-7, `sin`/`cos` abs < 5e-7 (for
/// arguments within a few thousand radians), `atan` rel < 2e-6,
/// `erf`/`erfc` abs < 5e-7 (relative error degrades in the erfc tail).
pub(crate) mod softmath {
    /// exp(x), relative error < 2e-7.
    pub fn exp(x: f32) -> f32 {
        if x > 88.72 {
            return f32::INFINITY;
        }
        if x < -87.33 {
            return 0.0;
        }
        if x.is_nan() {
            return x;
        }
        const LOG2E: f32 = 1.442695040888963;
        const C1: f32 = 0.693_359_4;
        const C2: f32 = -2.121_944_4e-4;
        let z = (LOG2E * x + 0.5).floor();
        let r = x - z * C1 - z * C2;
        let r2 = r * r;
        let mut p = 1.987_569_1e-4_f32;
        p = p * r + 1.398_199_9e-3;
        p = p * r + 8.333_452e-3;
        p = p * r + 4.166_579_6e-2;
        p = p * r + 1.666_666_6e-1;
        p = p * r + 5.000_000_1e-1;
        let y = p * r2 + r + 1.0;
        // Scale by 2^z through the exponent bits.
        let scale = f32::from_bits((((z as i32) + 127) as u32) << 23);
        y * scale
    }

    /// ln(x), relative error < 5e-7.
    pub fn log(x: f32) -> f32 {
        if x.is_nan() || x < 0.0 {
            return f32::NAN;
        }
        if x == 0.0 {
            return f32::NEG_INFINITY;
        }
        if x.is_infinite() {
            return x;
        }
        const SQRT_HALF: f32 = 0.707_106_78;
        const LN2_HI: f32 = 0.693_359_4;
        const LN2_LO: f32 = -2.121_944_4e-4;
        let bits = x.to_bits();
        let mut e = ((bits >> 23) as i32) - 126;
        let mut m = f32::from_bits((bits & 0x007f_ffff) | 0x3f00_0000); // [0.5, 1)
        if m < SQRT_HALF {
            e -= 1;
            m = m + m - 1.0;
        } else {
            m -= 1.0;
        }
        let z = m * m;
        let mut p = 7.037_683_6e-2_f32;
        p = p * m - 1.151_461e-1;
        p = p * m + 1.167_699_8e-1;
        p = p * m - 1.242_014_1e-1;
        p = p * m + 1.424_932_3e-1;
        p = p * m - 1.666_805_7e-1;
        p = p * m + 2.000_071_5e-1;
        p = p * m - 2.499_999_4e-1;
        p = p * m + 3.333_333e-1;
        let mut y = m * z * p;
        y -= 0.5 * z;
        let ef = e as f32;
        m + y + ef * LN2_LO + ef * LN2_HI
    }

    // Range reduction runs in f64 so the quadrant remainder stays exact to
    // well under an f32 ulp even for arguments in the thousands of radians.
    const FOPI: f64 = 1.273_239_544_735_162_7; // 4/pi
    const QUARTER_PI: f64 = std::f64::consts::FRAC_PI_4;

    fn sincos_poly(x: f64, cosine: bool) -> f64 {
        let z = x * x;
        if cosine {
            let mut p = 2.443_315_711_809_948e-5_f64;
            p = p * z - 1.388_731_625_493_765e-3;
            p = p * z + 4.166_664_568_298_827e-2;
            1.0 - 0.5 * z + p * z * z
        } else {
            let mut p = -1.951_529_589_1e-4_f64;
            p = p * z + 8.332_160_873_6e-3;
            p = p * z - 1.666_665_461_1e-1;
            x + x * z * p
        }
    }

    /// sin(x), absolute error < 5e-7 for moderate arguments.
    pub fn sin(x: f32) -> f32 {
        if !x.is_finite() {
            return f32::NAN;
        }
        let mut sign = if x < 0.0 { -1.0f64 } else { 1.0 };
        let ax = x.abs() as f64;
        let mut j = (FOPI * ax) as u64;
        if j & 1 == 1 {
            j += 1;
        }
        let r = ax - j as f64 * QUARTER_PI;
        let j = j & 7;
        let j = if j > 3 {
            sign = -sign;
            j - 4
        } else {
            j
        };
        (sign * sincos_poly(r, j == 1 || j == 2)) as f32
    }

    /// cos(x), absolute error < 5e-7 for moderate arguments.
    pub fn cos(x: f32) -> f32 {
        if !x.is_finite() {
            return f32::NAN;
        }
        let ax = x.abs() as f64;
        let mut j = (FOPI * ax) as u64;
        if j & 1 == 1 {
            j += 1;
        }
        let r = ax - j as f64 * QUARTER_PI;
        let j = j & 7;
        let mut sign = 1.0f64;
        let j = if j > 3 {
            sign = -sign;
            j - 4
        } else {
            j
        };
        if j > 1 {
            sign = -sign;
        }
        // Offset by a quadrant relative to sine.
        (sign * sincos_poly(r, !(j == 1 || j == 2))) as f32
    }

    /// atan(x), relative error < 2e-6.
    pub fn atan(x: f32) -> f32 {
        const PI_2: f32 = std::f32::consts::FRAC_PI_2;
        const PI_4: f32 = std::f32::consts::FRAC_PI_4;
        const TAN_3PI_8: f32 = 2.414_213_5;
        const TAN_PI_8: f32 = 0.414_213_56;
        if x.is_nan() {
            return x;
        }
        let sign = if x < 0.0 { -1.0 } else { 1.0 };
        let ax = x.abs();
        let (y, r) = if ax > TAN_3PI_8 {
            (PI_2, -1.0 / ax)
        } else if ax > TAN_PI_8 {
            (PI_4, (ax - 1.0) / (ax + 1.0))
        } else {
            (0.0, ax)
        };
        let z = r * r;
        let mut p = 8.053_744_5e-2_f32;
        p = p * z - 1.387_768_6e-1;
        p = p * z + 1.997_771_1e-1;
        p = p * z - 3.333_294_9e-1;
        sign * (y + p * z * r + r)
    }

    /// erfc(x), absolute error < 5e-7 (Abramowitz & Stegun 7.1.26).
    pub fn erfc(x: f32) -> f32 {
        let ax = x.abs();
        let t = 1.0 / (1.0 + 0.327_591_1 * ax);
        let mut p = 1.061_405_4_f32;
        p = p * t - 1.453_152_f32;
        p = p * t + 1.421_413_7;
        p = p * t - 0.284_496_74;
        p = p * t + 0.254_829_6;
        let r = p * t * exp(-ax * ax);
        if x < 0.0 {
            2.0 - r
        } else {
            r
        }
    }

    /// erf(x), absolute error < 5e-7.
    pub fn erf(x: f32) -> f32 {
        1.0 - erfc(x)
    }

    /// erf in f64, same approximation (the polynomial error dominates).
    pub fn erf_f64(x: f64) -> f64 {
        let ax = x.abs();
        let t = 1.0 / (1.0 + 0.3275911 * ax);
        let p = ((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
            + 0.254829592;
        let r = 1.0 - p * t * (-ax * ax).exp();
        if x < 0.0 {
            -r
        } else {
            r
        }
    }

    /// Threefry-2x32, 5 four-round groups with the standard key schedule.
    pub fn threefry2x32(key: [u32; 2], ctr: [u32; 2]) -> [u32; 2] {
        const ROT: [[u32; 4]; 2] = [[13, 15, 26, 6], [17, 29, 16, 24]];
        let ks = [key[0], key[1], 0x1BD1_1BDA ^ key[0] ^ key[1]];
        let mut x = [ctr[0].wrapping_add(ks[0]), ctr[1].wrapping_add(ks[1])];
        for i in 0..5u32 {
            for &rot in &ROT[(i % 2) as usize] {
                x[0] = x[0].wrapping_add(x[1]);
                x[1] = x[1].rotate_left(rot) ^ x[0];
            }
            x[0] = x[0].wrapping_add(ks[((i + 1) % 3) as usize]);
            x[1] = x[1].wrapping_add(ks[((i + 2) % 3) as usize]).wrapping_add(i + 1);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::softmath::*;
    use super::*;
    use crate::alu::AluExp;

    #[test]
    fn test_threefry_known_answer() {
        assert_eq!(threefry2x32([0, 0], [0, 0]), [1_797_259_609, 2_579_123_966]);
    }

    #[test]
    fn test_threefry_distinct_counters() {
        let a = threefry2x32([1, 2], [0, 0]);
        let b = threefry2x32([1, 2], [1, 0]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_exp_accuracy() {
        for i in -800..=800 {
            let x = i as f32 * 0.1;
            let expected = (x as f64).exp();
            let got = exp(x) as f64;
            let rel = ((got - expected) / expected).abs();
            assert!(rel < 2e-7, "exp({}) rel err {}", x, rel);
        }
        assert_eq!(exp(1000.0), f32::INFINITY);
        assert_eq!(exp(-1000.0), 0.0);
    }

    #[test]
    fn test_log_accuracy() {
        for i in 1..=10_000 {
            let x = i as f32 * 0.01;
            let expected = (x as f64).ln();
            let got = log(x) as f64;
            let tol = 5e-7 * expected.abs().max(1e-30) + 1e-7;
            assert!((got - expected).abs() < tol, "log({}) = {} vs {}", x, got, expected);
        }
        assert!(log(-1.0).is_nan());
        assert_eq!(log(0.0), f32::NEG_INFINITY);
    }

    #[test]
    fn test_sincos_accuracy() {
        for i in -1000..=1000 {
            let x = i as f32 * 0.01;
            assert!((sin(x) as f64 - (x as f64).sin()).abs() < 5e-7, "sin({})", x);
            assert!((cos(x) as f64 - (x as f64).cos()).abs() < 5e-7, "cos({})", x);
        }
    }

    #[test]
    fn test_atan_accuracy() {
        for i in -500..=500 {
            let x = i as f32 * 0.05;
            let expected = (x as f64).atan();
            let got = atan(x) as f64;
            assert!(
                (got - expected).abs() < 2e-6 * expected.abs().max(1.0),
                "atan({}) = {} vs {}",
                x,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_erf_bounds() {
        // Spot-check against high-precision values.
        let cases = [(0.0, 0.0), (0.5, 0.5204998778), (1.0, 0.8427007929), (2.0, 0.9953222650)];
        for (x, expected) in cases {
            assert!((erf(x) as f64 - expected).abs() < 2e-6, "erf({})", x);
            assert!((erfc(x) as f64 - (1.0 - expected)).abs() < 2e-6, "erfc({})", x);
        }
        assert!((erf(-1.0) + 0.8427007929).abs() < 2e-6);
    }

    #[test]
    fn test_vm_elementwise() {
        let b = WasmBackend::new();
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let x = b.malloc(3, DType::Float32, Some(&bytes)).unwrap();
        let out = b.malloc(3, DType::Float32, None).unwrap();

        let gidx = AluExp::special(Special::Gidx, 3);
        let load = AluExp::global_index(DType::Float32, 0, gidx);
        let exp = load.mul(&load).add(&AluExp::f32(1.0));
        let kernel = Kernel { num_inputs: 1, size: 3, exp, reduction: None };

        let exe = b.prepare(&kernel).unwrap();
        b.dispatch(exe.as_ref(), &[x], &[out]).unwrap();
        let result = b.read(out, 0, None).unwrap();
        let result: Vec<f32> =
            result.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(result, vec![2.0, 5.0, 10.0]);
    }

    #[test]
    fn test_f64_rejected() {
        let b = WasmBackend::new();
        let exp = AluExp::constant(DType::Float64, Scalar::F64(1.0));
        let kernel = Kernel { num_inputs: 0, size: 1, exp, reduction: None };
        assert!(matches!(b.prepare(&kernel), Err(Error::Unsupported { .. })));
    }
}

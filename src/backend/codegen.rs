//! WGSL generation for tuned kernels.
//!
//! One shader per (kernel, plan): storage bindings 0..N-1 for inputs,
//! binding N for the output. Sizes are baked in as constants since kernels
//! are shape-specialized. The reduction skeleton is an explicit loop with
//! compile-time unrolling; `group` lowers to a shared-memory tree reduction
//! with barriers.

use crate::alu::{AluExp, AluOp, Special};
use crate::backend::Device;
use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, ReduceOp};
use crate::tuner::Plan;
use std::collections::HashMap;

/// Maximum workgroups along X; further threads wrap to Y.
pub const GRID_WRAP: u64 = 16384;

/// A rendered shader and its launch geometry.
pub struct Shader {
    /// WGSL source text
    pub source: String,
    /// Workgroup size along x
    pub workgroup_size: u32,
    /// Total workgroups to launch
    pub workgroups: u64,
}

/// Storage type of a dtype. Bool is stored as i32.
fn storage_ty(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::Bool | DType::Int32 => Ok("i32"),
        DType::Uint32 => Ok("u32"),
        DType::Float16 | DType::Float32 => Ok("f32"),
        DType::Float64 => Err(Error::Unsupported {
            device: Device::WebGpu,
            what: "float64 storage".into(),
        }),
    }
}

/// Register type of a dtype. Bool is a native boolean in registers.
fn register_ty(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::Bool => Ok("bool"),
        DType::Int32 => Ok("i32"),
        DType::Uint32 => Ok("u32"),
        DType::Float16 | DType::Float32 => Ok("f32"),
        DType::Float64 => Err(Error::Unsupported {
            device: Device::WebGpu,
            what: "float64 registers".into(),
        }),
    }
}

fn literal(dtype: DType, v: Scalar) -> Result<String> {
    Ok(match dtype {
        DType::Bool => format!("bool({})", v.as_bool()),
        DType::Int32 => format!("i32({})", v.cast(DType::Int32).as_i64() as i32),
        DType::Uint32 => format!("u32({}u)", v.cast(DType::Uint32).as_i64() as u32),
        DType::Float16 | DType::Float32 => {
            let f = v.as_f64() as f32;
            if f.is_nan() || f.is_infinite() {
                // NaN and infinities through their canonical bit patterns.
                format!("bitcast<f32>(0x{:08x}u)", f.to_bits())
            } else {
                format!("f32({:?})", f)
            }
        }
        DType::Float64 => {
            return Err(Error::Unsupported {
                device: Device::WebGpu,
                what: "float64 literal".into(),
            })
        }
    })
}

/// Renders expressions into SSA-style `let` bindings within one scope.
struct Renderer<'a> {
    lines: Vec<String>,
    memo: HashMap<AluExp, String>,
    counter: &'a mut usize,
    specials: HashMap<Special, String>,
    input_dtypes: &'a HashMap<usize, DType>,
    indent: String,
    uses_erf: &'a mut bool,
}

impl<'a> Renderer<'a> {
    fn bind(&mut self, dtype: DType, rhs: String) -> Result<String> {
        let name = format!("v{}", self.counter);
        *self.counter += 1;
        self.lines
            .push(format!("{}let {}: {} = {};", self.indent, name, register_ty(dtype)?, rhs));
        Ok(name)
    }

    fn expr(&mut self, e: &AluExp) -> Result<String> {
        if let Some(name) = self.memo.get(e) {
            return Ok(name.clone());
        }
        let text = self.render(e)?;
        // Leaves stay inline; everything else gets a binding so shared
        // subtrees are computed once.
        let name = if e.src().is_empty() {
            text
        } else {
            self.bind(e.dtype(), text)?
        };
        self.memo.insert(e.clone(), name.clone());
        Ok(name)
    }

    fn render(&mut self, e: &AluExp) -> Result<String> {
        Ok(match e.op() {
            AluOp::Const(c) => literal(e.dtype(), *c)?,
            AluOp::Special(kind, _) => self
                .specials
                .get(kind)
                .unwrap_or_else(|| panic!("special `{}` not bound in shader", kind.name()))
                .clone(),
            AluOp::GlobalIndex(gid) => {
                let idx = self.expr(&e.src()[0])?;
                let in_dtype = self.input_dtypes.get(gid).copied().unwrap_or(e.dtype());
                let load = format!("g{}[u32({})]", gid, idx);
                if in_dtype == DType::Bool {
                    format!("({} != 0)", load)
                } else {
                    load
                }
            }
            AluOp::GlobalView(..) => {
                unreachable!("global views are resolved before codegen")
            }
            AluOp::Add => self.binary(e, "+")?,
            AluOp::Sub => self.binary(e, "-")?,
            AluOp::Mul => self.binary(e, "*")?,
            AluOp::Div | AluOp::IDiv => self.binary(e, "/")?,
            AluOp::Mod => self.binary(e, "%")?,
            AluOp::Min => self.call2(e, "min")?,
            AluOp::Max => self.call2(e, "max")?,
            AluOp::Pow => self.call2(e, "pow")?,
            AluOp::Neg => format!("-({})", self.expr(&e.src()[0])?),
            AluOp::Recip => format!("(1.0 / {})", self.expr(&e.src()[0])?),
            AluOp::Sqrt => self.call1(e, "sqrt")?,
            AluOp::Abs => self.call1(e, "abs")?,
            AluOp::Exp => self.call1(e, "exp")?,
            AluOp::Log => self.call1(e, "log")?,
            AluOp::Sin => self.call1(e, "sin")?,
            AluOp::Cos => self.call1(e, "cos")?,
            AluOp::Tan => self.call1(e, "tan")?,
            AluOp::Atan => self.call1(e, "atan")?,
            AluOp::Asin => self.call1(e, "asin")?,
            AluOp::Erf => {
                *self.uses_erf = true;
                self.call1(e, "mj_erf")?
            }
            AluOp::Erfc => {
                *self.uses_erf = true;
                self.call1(e, "mj_erfc")?
            }
            AluOp::CmpEq => self.binary(e, "==")?,
            AluOp::CmpNe => self.binary(e, "!=")?,
            AluOp::CmpLt => self.binary(e, "<")?,
            AluOp::CmpLe => self.binary(e, "<=")?,
            AluOp::CmpGt => self.binary(e, ">")?,
            AluOp::CmpGe => self.binary(e, ">=")?,
            AluOp::Where => {
                let c = self.expr(&e.src()[0])?;
                let x = self.expr(&e.src()[1])?;
                let y = self.expr(&e.src()[2])?;
                format!("select({}, {}, {})", y, x, c)
            }
            AluOp::Cast => {
                let x = self.expr(&e.src()[0])?;
                let from = e.src()[0].dtype();
                match (from, e.dtype()) {
                    (a, b) if a == b => x,
                    (DType::Bool, to) => {
                        let one = literal(to, Scalar::one(to))?;
                        let zero = literal(to, Scalar::zero(to))?;
                        format!("select({}, {}, {})", zero, one, x)
                    }
                    (_, to) => format!("{}({})", register_ty(to)?, x),
                }
            }
        })
    }

    fn binary(&mut self, e: &AluExp, op: &str) -> Result<String> {
        let a = self.expr(&e.src()[0])?;
        let b = self.expr(&e.src()[1])?;
        Ok(format!("({} {} {})", a, op, b))
    }

    fn call1(&mut self, e: &AluExp, f: &str) -> Result<String> {
        Ok(format!("{}({})", f, self.expr(&e.src()[0])?))
    }

    fn call2(&mut self, e: &AluExp, f: &str) -> Result<String> {
        let a = self.expr(&e.src()[0])?;
        let b = self.expr(&e.src()[1])?;
        Ok(format!("{}({}, {})", f, a, b))
    }
}

fn combine_stmt(op: ReduceOp, acc: &str, v: &str) -> String {
    match op {
        ReduceOp::Add => format!("{} = {} + {};", acc, acc, v),
        ReduceOp::Mul => format!("{} = {} * {};", acc, acc, v),
        ReduceOp::Min => format!("{} = min({}, {});", acc, acc, v),
        ReduceOp::Max => format!("{} = max({}, {});", acc, acc, v),
    }
}

/// Gather `gid -> dtype` for every global read in the plan.
fn input_dtypes(plan: &Plan, kernel: &Kernel) -> HashMap<usize, DType> {
    let mut map = HashMap::new();
    let mut scan = |e: &AluExp| {
        for node in e.collect(&|n| matches!(n.op(), AluOp::GlobalIndex(_))) {
            if let AluOp::GlobalIndex(gid) = node.op() {
                map.insert(*gid, node.dtype());
            }
        }
    };
    scan(&plan.exp);
    if let Some(f) = kernel.reduction.as_ref().and_then(|r| r.fusion.as_ref()) {
        scan(f);
    }
    map
}

/// Render a tuned kernel to WGSL.
pub fn render(kernel: &Kernel, plan: &Plan) -> Result<Shader> {
    let dims = plan.dims;
    let out_dtype = kernel.dtype();
    let out_store = storage_ty(out_dtype)?;
    let in_dtypes = input_dtypes(plan, kernel);

    let grouped = dims.groups > 1;
    let workgroup_size: u32 = if grouped { dims.groups as u32 } else { 64 };
    let out_threads = plan.threads / dims.groups;

    let mut counter = 0usize;
    let mut uses_erf = false;
    let mut body: Vec<String> = Vec::new();

    // Thread identity and grid tiling.
    if grouped {
        body.push(format!("    let batch = wg_id.x + wg_id.y * {}u;", GRID_WRAP));
        body.push(format!("    if (batch >= {}u) {{ return; }}", out_threads.max(1)));
        body.push("    let gidx: i32 = i32(batch);".into());
        body.push("    let lane: i32 = i32(lid.x);".into());
    } else {
        body.push(format!("    let batch = wg_id.x + wg_id.y * {}u;", GRID_WRAP));
        body.push(format!("    let tid = batch * {}u + lid.x;", workgroup_size));
        body.push(format!("    if (tid >= {}u) {{ return; }}", plan.threads.max(1)));
        body.push("    let gidx: i32 = i32(tid);".into());
    }

    let base_specials = |lane_expr: Option<&str>| {
        let mut m: HashMap<Special, String> = HashMap::new();
        m.insert(Special::Gidx, "gidx".into());
        if let Some(lane) = lane_expr {
            m.insert(Special::Group, lane.into());
        }
        m
    };

    let body_dtype = plan.exp.dtype();
    let acc_ty = register_ty(body_dtype)?;

    for u in 0..dims.upcast {
        // Per-lane constants fold the upcast index away at compile time.
        let mut lane_subst = HashMap::new();
        lane_subst.insert(Special::Upcast, AluExp::i32(u as i32));
        let out_index = plan.output_index.substitute(&lane_subst).simplify();
        let lane_exp = plan.exp.substitute(&lane_subst);

        match &kernel.reduction {
            None => {
                let mut r = Renderer {
                    lines: Vec::new(),
                    memo: HashMap::new(),
                    counter: &mut counter,
                    specials: base_specials(None),
                    input_dtypes: &in_dtypes,
                    indent: "    ".into(),
                    uses_erf: &mut uses_erf,
                };
                let value = r.expr(&lane_exp.simplify())?;
                let idx = r.expr(&out_index)?;
                body.extend(r.lines);
                body.push(format!("    out0[u32({})] = {};", idx, store_cast(out_dtype, &value)));
            }
            Some(red) => {
                let acc_name = format!("acc{}", u);
                body.push(format!(
                    "    var {}: {} = {};",
                    acc_name,
                    acc_ty,
                    literal(body_dtype, red.op.identity(body_dtype))?
                ));
                body.push(format!(
                    "    for (var r: i32 = 0; r < {}; r = r + 1) {{",
                    dims.reduce
                ));
                for ul in 0..dims.unroll {
                    let mut subst = HashMap::new();
                    subst.insert(Special::Unroll, AluExp::i32(ul as i32));
                    let unrolled = lane_exp.substitute(&subst).simplify();
                    let mut specials = base_specials(if grouped { Some("lane") } else { None });
                    specials.insert(Special::Ridx, "r".into());
                    let mut r = Renderer {
                        lines: Vec::new(),
                        memo: HashMap::new(),
                        counter: &mut counter,
                        specials,
                        input_dtypes: &in_dtypes,
                        indent: "        ".into(),
                        uses_erf: &mut uses_erf,
                    };
                    let v = r.expr(&unrolled)?;
                    body.extend(r.lines);
                    body.push(format!("        {}", combine_stmt(red.op, &acc_name, &v)));
                }
                body.push("    }".into());

                if grouped {
                    body.push(format!(
                        "    shared_acc[lid.x * {}u + {}u] = {};",
                        dims.upcast, u, acc_name
                    ));
                } else {
                    let (epilogue, out_idx) =
                        render_epilogue(red, &acc_name, &out_index, &mut counter, &in_dtypes, &mut uses_erf)?;
                    body.extend(epilogue);
                    body.push(format!(
                        "    out0[u32({})] = {};",
                        out_idx.0,
                        store_cast(out_dtype, &out_idx.1)
                    ));
                }
            }
        }
    }

    // Shared-memory tree reduction for grouped kernels.
    if grouped {
        let red = kernel.reduction.as_ref().expect("groups imply a reduction");
        body.push("    workgroupBarrier();".into());
        body.push(format!(
            "    for (var s: u32 = {}u; s > 0u; s = s >> 1u) {{",
            dims.groups / 2
        ));
        body.push("        if (lid.x < s) {".into());
        for u in 0..dims.upcast {
            let a = format!("shared_acc[lid.x * {}u + {}u]", dims.upcast, u);
            let b = format!("shared_acc[(lid.x + s) * {}u + {}u]", dims.upcast, u);
            body.push(format!("            {}", combine_stmt(red.op, &a, &b)));
        }
        body.push("        }".into());
        body.push("        workgroupBarrier();".into());
        body.push("    }".into());
        body.push("    if (lid.x == 0u) {".into());
        for u in 0..dims.upcast {
            let mut lane_subst = HashMap::new();
            lane_subst.insert(Special::Upcast, AluExp::i32(u as i32));
            let out_index = plan.output_index.substitute(&lane_subst).simplify();
            let acc = format!("shared_acc[{}u]", u);
            let (epilogue, out_idx) =
                render_epilogue(red, &acc, &out_index, &mut counter, &in_dtypes, &mut uses_erf)?;
            for line in epilogue {
                body.push(format!("    {}", line));
            }
            body.push(format!(
                "        out0[u32({})] = {};",
                out_idx.0,
                store_cast(out_dtype, &out_idx.1)
            ));
        }
        body.push("    }".into());
    }

    // Assemble the module.
    let mut source = String::new();
    for gid in 0..kernel.num_inputs {
        let dtype = in_dtypes.get(&gid).copied().unwrap_or(DType::Float32);
        source.push_str(&format!(
            "@group(0) @binding({})\nvar<storage, read> g{}: array<{}>;\n\n",
            gid,
            gid,
            storage_ty(dtype)?
        ));
    }
    source.push_str(&format!(
        "@group(0) @binding({})\nvar<storage, read_write> out0: array<{}>;\n\n",
        kernel.num_inputs, out_store
    ));
    if grouped {
        source.push_str(&format!(
            "var<workgroup> shared_acc: array<{}, {}>;\n\n",
            acc_ty,
            dims.groups * dims.upcast
        ));
    }
    if uses_erf {
        source.push_str(ERF_HELPERS);
    }
    source.push_str(&format!(
        "@compute @workgroup_size({})\nfn main(\n    @builtin(workgroup_id) wg_id: vec3<u32>,\n    @builtin(local_invocation_id) lid: vec3<u32>,\n) {{\n",
        workgroup_size
    ));
    for line in &body {
        source.push_str(line);
        source.push('\n');
    }
    source.push_str("}\n");

    let workgroups = if grouped {
        out_threads.max(1) as u64
    } else {
        (plan.threads.max(1) as u64).div_ceil(workgroup_size as u64)
    };
    Ok(Shader { source, workgroup_size, workgroups })
}

type EpilogueOut = (Vec<String>, (String, String));

fn render_epilogue(
    red: &crate::kernel::Reduction,
    acc: &str,
    out_index: &AluExp,
    counter: &mut usize,
    in_dtypes: &HashMap<usize, DType>,
    uses_erf: &mut bool,
) -> Result<EpilogueOut> {
    let mut specials = HashMap::new();
    specials.insert(Special::Gidx, "gidx".to_string());
    specials.insert(Special::Acc, acc.to_string());
    let mut r = Renderer {
        lines: Vec::new(),
        memo: HashMap::new(),
        counter,
        specials,
        input_dtypes: in_dtypes,
        indent: "    ".into(),
        uses_erf,
    };
    let value = match &red.fusion {
        Some(f) => r.expr(f)?,
        None => acc.to_string(),
    };
    let idx = r.expr(out_index)?;
    Ok((r.lines, (idx, value)))
}

fn store_cast(dtype: DType, value: &str) -> String {
    if dtype == DType::Bool {
        format!("select(0, 1, {})", value)
    } else {
        value.to_string()
    }
}

const ERF_HELPERS: &str = r#"fn mj_erfc(x: f32) -> f32 {
    let ax = abs(x);
    let t = 1.0 / (1.0 + 0.3275911 * ax);
    let p = ((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
        + 0.254829592;
    let r = p * t * exp(-ax * ax);
    return select(r, 2.0 - r, x < 0.0);
}

fn mj_erf(x: f32) -> f32 {
    return 1.0 - mj_erfc(x);
}

"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Reduction;
    use crate::tracker::ShapeTracker;
    use crate::tuner::{null_plan, tuned_plan};

    fn sum_kernel(rows: usize, cols: usize) -> Kernel {
        let tracker = ShapeTracker::from_shape(&[rows, cols]);
        let idx = vec![
            AluExp::special(Special::Gidx, rows),
            AluExp::special(Special::Ridx, cols),
        ];
        let exp = AluExp::global_view(DType::Float32, 0, tracker, idx);
        Kernel {
            num_inputs: 1,
            size: rows,
            exp,
            reduction: Some(Reduction { op: ReduceOp::Add, size: cols, fusion: None }),
        }
    }

    #[test]
    fn test_render_elementwise() {
        let gidx = AluExp::special(Special::Gidx, 8);
        let load = AluExp::global_index(DType::Float32, 0, gidx);
        let kernel =
            Kernel { num_inputs: 1, size: 8, exp: load.mul(&load), reduction: None };
        let shader = render(&kernel, &null_plan(&kernel)).unwrap();
        assert!(shader.source.contains("@binding(0)"));
        assert!(shader.source.contains("var<storage, read_write> out0"));
        assert!(shader.source.contains("@workgroup_size(64)"));
        assert_eq!(shader.workgroups, 1);
    }

    #[test]
    fn test_render_reduction_loop() {
        let kernel = sum_kernel(4, 16);
        let shader = render(&kernel, &null_plan(&kernel)).unwrap();
        assert!(shader.source.contains("for (var r: i32 = 0; r < 16;"));
        assert!(shader.source.contains("acc0"));
    }

    #[test]
    fn test_render_nan_inf_literals() {
        // A non-constant condition keeps the simplifier from folding the
        // special values away before rendering.
        let cond = AluExp::special(Special::Gidx, 4).cmp_lt(&AluExp::i32(2));
        let exp = AluExp::select(&cond, &AluExp::f32(f32::NAN), &AluExp::f32(f32::NEG_INFINITY));
        let kernel = Kernel { num_inputs: 0, size: 4, exp, reduction: None };
        let shader = render(&kernel, &null_plan(&kernel)).unwrap();
        assert!(shader.source.contains("bitcast<f32>(0x7fc00000u)"));
        assert!(shader.source.contains("bitcast<f32>(0xff800000u)"));
    }

    #[test]
    fn test_render_bool_storage_as_i32() {
        let gidx = AluExp::special(Special::Gidx, 4);
        let load = AluExp::global_index(DType::Float32, 0, gidx);
        let exp = load.cmp_lt(&AluExp::f32(0.5));
        let kernel = Kernel { num_inputs: 1, size: 4, exp, reduction: None };
        let shader = render(&kernel, &null_plan(&kernel)).unwrap();
        assert!(shader.source.contains("array<i32>"), "bool output stored as i32");
        assert!(shader.source.contains("select(0, 1,"));
    }

    #[test]
    fn test_render_grouped_reduction_has_barriers() {
        // A long reduction with a single output triggers grouping.
        let kernel = sum_kernel(1, 4096);
        let plan = tuned_plan(&kernel);
        assert!(plan.dims.groups > 1, "expected grouping, got {:?}", plan.dims);
        let shader = render(&kernel, &plan).unwrap();
        assert!(shader.source.contains("var<workgroup> shared_acc"));
        assert!(shader.source.contains("workgroupBarrier();"));
        assert_eq!(shader.workgroup_size, plan.dims.groups as u32);
    }

    #[test]
    fn test_render_erf_helper_emitted_once() {
        let gidx = AluExp::special(Special::Gidx, 4);
        let x = AluExp::global_index(DType::Float32, 0, gidx);
        let exp = AluExp::new(AluOp::Erf, DType::Float32, vec![x]);
        let kernel = Kernel { num_inputs: 1, size: 4, exp, reduction: None };
        let shader = render(&kernel, &null_plan(&kernel)).unwrap();
        assert_eq!(shader.source.matches("fn mj_erfc").count(), 1);
    }

    #[test]
    fn test_grid_tiling_wraps_y() {
        let gidx = AluExp::special(Special::Gidx, 4 << 20);
        let exp = gidx.cast(DType::Float32);
        let kernel = Kernel { num_inputs: 0, size: 4 << 20, exp, reduction: None };
        let shader = render(&kernel, &null_plan(&kernel)).unwrap();
        assert!(shader.workgroups > GRID_WRAP);
        assert!(shader.source.contains(&format!("wg_id.y * {}u", GRID_WRAP)));
    }
}

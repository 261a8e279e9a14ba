//! The ALU expression IR: a small, pure, typed expression language.
//!
//! Every kernel computes one output scalar per output index by evaluating an
//! `AluExp` tree. Nodes are immutable and cheaply cloneable; equality is
//! structural, so shared sub-expressions compare (and hash) equal.

use crate::dtype::{DType, Scalar};
use crate::tracker::ShapeTracker;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Thread-index specials available inside a kernel body.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Special {
    /// Global output index (one per output element)
    Gidx,
    /// Reduction loop index
    Ridx,
    /// Cooperative-group lane index
    Group,
    /// Reduction accumulator (used by fused epilogues)
    Acc,
    /// Unrolled-loop lane index
    Unroll,
    /// Upcast lane index
    Upcast,
}

impl Special {
    /// Lowercase name used in generated code.
    pub fn name(self) -> &'static str {
        match self {
            Special::Gidx => "gidx",
            Special::Ridx => "ridx",
            Special::Group => "group",
            Special::Acc => "acc",
            Special::Unroll => "unroll",
            Special::Upcast => "upcast",
        }
    }
}

/// Operation tag of an expression node.
///
/// Auxiliary immutable data (constant value, special name, global id, shape
/// tracker) lives inside the variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AluOp {
    /// Literal constant
    Const(Scalar),
    /// Thread-index special with its extent
    Special(Special, usize),

    // Binary arithmetic
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (float semantics on floats, truncating on ints)
    Div,
    /// Flooring integer division
    IDiv,
    /// Remainder
    Mod,
    /// Elementwise minimum
    Min,
    /// Elementwise maximum
    Max,
    /// Power
    Pow,

    // Unary
    /// Negation
    Neg,
    /// Reciprocal
    Recip,
    /// Square root
    Sqrt,
    /// Absolute value
    Abs,
    /// Exponential
    Exp,
    /// Natural logarithm
    Log,
    /// Sine
    Sin,
    /// Cosine
    Cos,
    /// Tangent
    Tan,
    /// Arctangent
    Atan,
    /// Arcsine
    Asin,
    /// Error function
    Erf,
    /// Complementary error function
    Erfc,

    // Comparisons (result dtype Bool)
    /// Equality
    CmpEq,
    /// Inequality
    CmpNe,
    /// Less-than
    CmpLt,
    /// Less-or-equal
    CmpLe,
    /// Greater-than
    CmpGt,
    /// Greater-or-equal
    CmpGe,

    /// Ternary select: `where(cond, x, y)`
    Where,
    /// Cast to the node's dtype
    Cast,

    /// Read element `src[0]` of global input `gid`
    GlobalIndex(usize),
    /// Read global input `gid` by logical multi-index through a tracker
    GlobalView(usize, ShapeTracker),
}

impl AluOp {
    /// Expected child count, or None for variadic-checked ops.
    fn arity(&self) -> Option<usize> {
        match self {
            AluOp::Const(_) | AluOp::Special(..) => Some(0),
            AluOp::Add
            | AluOp::Sub
            | AluOp::Mul
            | AluOp::Div
            | AluOp::IDiv
            | AluOp::Mod
            | AluOp::Min
            | AluOp::Max
            | AluOp::Pow
            | AluOp::CmpEq
            | AluOp::CmpNe
            | AluOp::CmpLt
            | AluOp::CmpLe
            | AluOp::CmpGt
            | AluOp::CmpGe => Some(2),
            AluOp::Neg
            | AluOp::Recip
            | AluOp::Sqrt
            | AluOp::Abs
            | AluOp::Exp
            | AluOp::Log
            | AluOp::Sin
            | AluOp::Cos
            | AluOp::Tan
            | AluOp::Atan
            | AluOp::Asin
            | AluOp::Erf
            | AluOp::Erfc
            | AluOp::Cast => Some(1),
            AluOp::Where => Some(3),
            AluOp::GlobalIndex(_) => Some(1),
            AluOp::GlobalView(..) => None,
        }
    }

    /// True for ops whose operand order does not matter.
    fn is_commutative(&self) -> bool {
        matches!(
            self,
            AluOp::Add | AluOp::Mul | AluOp::Min | AluOp::Max | AluOp::CmpEq | AluOp::CmpNe
        )
    }
}

struct Node {
    op: AluOp,
    dtype: DType,
    src: Vec<AluExp>,
    hash: u64,
}

/// An immutable ALU expression.
///
/// Clones are cheap (`Arc`); equality and hashing are structural.
#[derive(Clone)]
pub struct AluExp(Arc<Node>);

impl AluExp {
    /// Generic constructor.
    ///
    /// # Panics
    ///
    /// Panics on arity mismatch or inconsistent child dtypes; constructing
    /// an ill-typed expression is a fatal usage error.
    pub fn new(op: AluOp, dtype: DType, src: Vec<AluExp>) -> AluExp {
        if let Some(n) = op.arity() {
            assert_eq!(n, src.len(), "{:?} expects {} children, got {}", op, n, src.len());
        }
        match &op {
            AluOp::Add
            | AluOp::Sub
            | AluOp::Mul
            | AluOp::Div
            | AluOp::IDiv
            | AluOp::Mod
            | AluOp::Min
            | AluOp::Max
            | AluOp::Pow => {
                assert!(
                    src.iter().all(|s| s.dtype() == dtype),
                    "{:?}: children must match node dtype {}",
                    op,
                    dtype
                );
            }
            AluOp::Neg
            | AluOp::Recip
            | AluOp::Sqrt
            | AluOp::Abs
            | AluOp::Exp
            | AluOp::Log
            | AluOp::Sin
            | AluOp::Cos
            | AluOp::Tan
            | AluOp::Atan
            | AluOp::Asin
            | AluOp::Erf
            | AluOp::Erfc => {
                assert_eq!(src[0].dtype(), dtype, "{:?}: child dtype mismatch", op);
            }
            AluOp::CmpEq
            | AluOp::CmpNe
            | AluOp::CmpLt
            | AluOp::CmpLe
            | AluOp::CmpGt
            | AluOp::CmpGe => {
                assert_eq!(dtype, DType::Bool, "comparison result must be bool");
                assert_eq!(src[0].dtype(), src[1].dtype(), "comparison operand dtype mismatch");
            }
            AluOp::Where => {
                assert_eq!(src[0].dtype(), DType::Bool, "where condition must be bool");
                assert_eq!(src[1].dtype(), dtype, "where branch dtype mismatch");
                assert_eq!(src[2].dtype(), dtype, "where branch dtype mismatch");
            }
            AluOp::GlobalIndex(_) => {
                assert_eq!(src[0].dtype(), DType::Int32, "global index must be int32");
            }
            AluOp::GlobalView(_, tracker) => {
                assert_eq!(
                    src.len(),
                    tracker.ndim(),
                    "global view index arity must match tracker rank"
                );
                assert!(
                    src.iter().all(|s| s.dtype() == DType::Int32),
                    "global view indices must be int32"
                );
            }
            AluOp::Const(_) | AluOp::Special(..) | AluOp::Cast => {}
        }

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        op.hash(&mut hasher);
        dtype.hash(&mut hasher);
        for s in &src {
            s.node_hash().hash(&mut hasher);
        }
        let hash = hasher.finish();
        AluExp(Arc::new(Node { op, dtype, src, hash }))
    }

    // ---- accessors -------------------------------------------------------

    /// The operation tag.
    pub fn op(&self) -> &AluOp {
        &self.0.op
    }

    /// The result dtype.
    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    /// Ordered children.
    pub fn src(&self) -> &[AluExp] {
        &self.0.src
    }

    pub(crate) fn node_hash(&self) -> u64 {
        self.0.hash
    }

    // ---- factories -------------------------------------------------------

    /// A constant of the given dtype.
    pub fn constant(dtype: DType, value: Scalar) -> AluExp {
        let value = match dtype {
            // Keep f16 constants in their representable set.
            DType::Float16 => value.cast(DType::Float16),
            d => value.cast(d),
        };
        AluExp::new(AluOp::Const(value), dtype, vec![])
    }

    /// An f32 constant.
    pub fn f32(v: f32) -> AluExp {
        AluExp::new(AluOp::Const(Scalar::F32(v)), DType::Float32, vec![])
    }

    /// An i32 constant (the index dtype).
    pub fn i32(v: i32) -> AluExp {
        AluExp::new(AluOp::Const(Scalar::I32(v)), DType::Int32, vec![])
    }

    /// A bool constant.
    pub fn bool(v: bool) -> AluExp {
        AluExp::new(AluOp::Const(Scalar::Bool(v)), DType::Bool, vec![])
    }

    /// A thread-index special. All specials except `acc` are int32.
    pub fn special(kind: Special, size: usize) -> AluExp {
        AluExp::new(AluOp::Special(kind, size), DType::Int32, vec![])
    }

    /// The reduction accumulator special, typed like the reduction.
    pub fn acc(dtype: DType) -> AluExp {
        AluExp::new(AluOp::Special(Special::Acc, 0), dtype, vec![])
    }

    /// Read element `index` of global input `gid` as `dtype`.
    pub fn global_index(dtype: DType, gid: usize, index: AluExp) -> AluExp {
        AluExp::new(AluOp::GlobalIndex(gid), dtype, vec![index])
    }

    /// Read global input `gid` by logical multi-index through `tracker`.
    pub fn global_view(
        dtype: DType,
        gid: usize,
        tracker: ShapeTracker,
        indices: Vec<AluExp>,
    ) -> AluExp {
        AluExp::new(AluOp::GlobalView(gid, tracker), dtype, indices)
    }

    fn binary(&self, op: AluOp, other: &AluExp) -> AluExp {
        AluExp::new(op, self.dtype(), vec![self.clone(), other.clone()])
    }

    fn unary(&self, op: AluOp) -> AluExp {
        AluExp::new(op, self.dtype(), vec![self.clone()])
    }

    fn compare(&self, op: AluOp, other: &AluExp) -> AluExp {
        AluExp::new(op, DType::Bool, vec![self.clone(), other.clone()])
    }

    /// `self + other`
    pub fn add(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Add, other)
    }
    /// `self - other`
    pub fn sub(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Sub, other)
    }
    /// `self * other`
    pub fn mul(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Mul, other)
    }
    /// `self / other`
    pub fn div(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Div, other)
    }
    /// Flooring integer division.
    pub fn idiv(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::IDiv, other)
    }
    /// Remainder.
    pub fn modulo(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Mod, other)
    }
    /// Elementwise minimum.
    pub fn min(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Min, other)
    }
    /// Elementwise maximum.
    pub fn max(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Max, other)
    }
    /// Power.
    pub fn pow(&self, other: &AluExp) -> AluExp {
        self.binary(AluOp::Pow, other)
    }
    /// Negation.
    pub fn neg(&self) -> AluExp {
        self.unary(AluOp::Neg)
    }
    /// Reciprocal.
    pub fn recip(&self) -> AluExp {
        self.unary(AluOp::Recip)
    }
    /// Absolute value.
    pub fn unary_abs(&self) -> AluExp {
        self.unary(AluOp::Abs)
    }
    /// Square root.
    pub fn unary_sqrt(&self) -> AluExp {
        self.unary(AluOp::Sqrt)
    }
    /// Exponential.
    pub fn unary_exp(&self) -> AluExp {
        self.unary(AluOp::Exp)
    }
    /// Natural logarithm.
    pub fn unary_log(&self) -> AluExp {
        self.unary(AluOp::Log)
    }
    /// Sine.
    pub fn unary_sin(&self) -> AluExp {
        self.unary(AluOp::Sin)
    }
    /// Cosine.
    pub fn unary_cos(&self) -> AluExp {
        self.unary(AluOp::Cos)
    }
    /// Tangent.
    pub fn unary_tan(&self) -> AluExp {
        self.unary(AluOp::Tan)
    }
    /// Arctangent.
    pub fn unary_atan(&self) -> AluExp {
        self.unary(AluOp::Atan)
    }
    /// Arcsine.
    pub fn unary_asin(&self) -> AluExp {
        self.unary(AluOp::Asin)
    }
    /// Error function.
    pub fn unary_erf(&self) -> AluExp {
        self.unary(AluOp::Erf)
    }
    /// Complementary error function.
    pub fn unary_erfc(&self) -> AluExp {
        self.unary(AluOp::Erfc)
    }
    /// `self == other`
    pub fn cmp_eq(&self, other: &AluExp) -> AluExp {
        self.compare(AluOp::CmpEq, other)
    }
    /// `self != other`
    pub fn cmp_ne(&self, other: &AluExp) -> AluExp {
        self.compare(AluOp::CmpNe, other)
    }
    /// `self < other`
    pub fn cmp_lt(&self, other: &AluExp) -> AluExp {
        self.compare(AluOp::CmpLt, other)
    }
    /// `self <= other`
    pub fn cmp_le(&self, other: &AluExp) -> AluExp {
        self.compare(AluOp::CmpLe, other)
    }
    /// `self > other`
    pub fn cmp_gt(&self, other: &AluExp) -> AluExp {
        self.compare(AluOp::CmpGt, other)
    }
    /// `self >= other`
    pub fn cmp_ge(&self, other: &AluExp) -> AluExp {
        self.compare(AluOp::CmpGe, other)
    }

    /// Ternary select.
    pub fn select(cond: &AluExp, x: &AluExp, y: &AluExp) -> AluExp {
        AluExp::new(AluOp::Where, x.dtype(), vec![cond.clone(), x.clone(), y.clone()])
    }

    /// Boolean conjunction, expressed through `where`.
    pub fn and(a: &AluExp, b: &AluExp) -> AluExp {
        AluExp::select(a, b, &AluExp::bool(false))
    }

    /// Cast to a target dtype.
    pub fn cast(&self, dtype: DType) -> AluExp {
        AluExp::new(AluOp::Cast, dtype, vec![self.clone()])
    }

    /// Decompose a flat int32 index into row-major coordinates of `shape`.
    pub fn unflatten(flat: &AluExp, shape: &[usize]) -> Vec<AluExp> {
        let mut out = Vec::with_capacity(shape.len());
        let mut inner: usize = shape.iter().product();
        for &dim in shape {
            inner /= dim;
            let q = flat.idiv(&AluExp::i32(inner as i32));
            out.push(q.modulo(&AluExp::i32(dim as i32)));
        }
        out
    }

    /// Row-major flatten of coordinates over `shape`.
    pub fn flatten(indices: &[AluExp], shape: &[usize]) -> AluExp {
        let strides = crate::Shape::new(shape.to_vec()).default_strides();
        let mut acc = AluExp::i32(0);
        for (idx, stride) in indices.iter().zip(strides) {
            acc = acc.add(&idx.mul(&AluExp::i32(stride as i32)));
        }
        acc
    }

    // ---- traversal -------------------------------------------------------

    /// Post-order gather of every unique node matching `pred`.
    pub fn collect(&self, pred: &dyn Fn(&AluExp) -> bool) -> Vec<AluExp> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        self.collect_into(pred, &mut seen, &mut out);
        out
    }

    fn collect_into(
        &self,
        pred: &dyn Fn(&AluExp) -> bool,
        seen: &mut std::collections::HashSet<*const Node>,
        out: &mut Vec<AluExp>,
    ) {
        let ptr = Arc::as_ptr(&self.0);
        if !seen.insert(ptr) {
            return;
        }
        for s in self.src() {
            s.collect_into(pred, seen, out);
        }
        if pred(self) {
            out.push(self.clone());
        }
    }

    /// Bottom-up term rewriting.
    ///
    /// Children are rewritten first; `f` is then applied once to the rebuilt
    /// node and its replacement (if any) is taken as-is. Shared nodes are
    /// rewritten once and stay shared.
    pub fn rewrite(&self, f: &dyn Fn(&AluExp) -> Option<AluExp>) -> AluExp {
        let mut memo = HashMap::new();
        self.rewrite_memo(f, &mut memo)
    }

    fn rewrite_memo(
        &self,
        f: &dyn Fn(&AluExp) -> Option<AluExp>,
        memo: &mut HashMap<*const Node, AluExp>,
    ) -> AluExp {
        let ptr = Arc::as_ptr(&self.0);
        if let Some(r) = memo.get(&ptr) {
            return r.clone();
        }
        let rebuilt = if self.src().is_empty() {
            self.clone()
        } else {
            let src: Vec<AluExp> = self.src().iter().map(|s| s.rewrite_memo(f, memo)).collect();
            if src.iter().zip(self.src()).all(|(a, b)| a.ptr_eq(b)) {
                self.clone()
            } else {
                AluExp::new(self.op().clone(), self.dtype(), src)
            }
        };
        let result = f(&rebuilt).unwrap_or(rebuilt);
        memo.insert(ptr, result.clone());
        result
    }

    /// Replace named specials with sub-expressions.
    pub fn substitute(&self, map: &HashMap<Special, AluExp>) -> AluExp {
        self.rewrite(&|e| match e.op() {
            AluOp::Special(kind, _) => map.get(kind).cloned(),
            _ => None,
        })
    }

    fn ptr_eq(&self, other: &AluExp) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ---- simplifier ------------------------------------------------------

    /// Algebraic simplification to a fixed point.
    pub fn simplify(&self) -> AluExp {
        let mut cur = self.clone();
        for _ in 0..12 {
            let next = cur.rewrite(&simplify_step);
            if next == cur {
                return next;
            }
            cur = next;
        }
        cur
    }

    // ---- evaluation ------------------------------------------------------

    /// Tree-walk evaluation.
    ///
    /// # Panics
    ///
    /// Panics if a special referenced by the expression is absent from the
    /// environment; that is a fatal usage error.
    pub fn evaluate(&self, env: &EvalEnv<'_>) -> Scalar {
        match self.op() {
            AluOp::Const(c) => *c,
            AluOp::Special(kind, _) => *env
                .specials
                .get(kind)
                .unwrap_or_else(|| panic!("missing special `{}` in evaluation", kind.name())),
            AluOp::Cast => self.src()[0].evaluate(env).cast(self.dtype()),
            AluOp::Where => {
                if self.src()[0].evaluate(env).as_bool() {
                    self.src()[1].evaluate(env)
                } else {
                    self.src()[2].evaluate(env)
                }
            }
            AluOp::GlobalIndex(gid) => {
                let idx = self.src()[0].evaluate(env).as_i64();
                (env.globals)(*gid, idx)
            }
            AluOp::GlobalView(gid, tracker) => {
                let indices: Vec<i64> =
                    self.src().iter().map(|s| s.evaluate(env).as_i64()).collect();
                match tracker.locate(&indices) {
                    Some(off) => (env.globals)(*gid, off),
                    None => Scalar::zero(self.dtype()),
                }
            }
            AluOp::Neg
            | AluOp::Recip
            | AluOp::Sqrt
            | AluOp::Abs
            | AluOp::Exp
            | AluOp::Log
            | AluOp::Sin
            | AluOp::Cos
            | AluOp::Tan
            | AluOp::Atan
            | AluOp::Asin
            | AluOp::Erf
            | AluOp::Erfc => eval_unary(self.op(), self.dtype(), self.src()[0].evaluate(env)),
            _ => {
                let a = self.src()[0].evaluate(env);
                let b = self.src()[1].evaluate(env);
                eval_binary(self.op(), self.dtype(), a, b)
            }
        }
    }

    /// True if this node and everything below it is constant.
    fn is_const_tree(&self) -> bool {
        match self.op() {
            AluOp::Const(_) => true,
            AluOp::Special(..) | AluOp::GlobalIndex(_) | AluOp::GlobalView(..) => false,
            _ => self.src().iter().all(|s| s.is_const_tree()),
        }
    }

    fn const_value(&self) -> Option<Scalar> {
        match self.op() {
            AluOp::Const(c) => Some(*c),
            _ => None,
        }
    }
}

/// Environment for [`AluExp::evaluate`].
pub struct EvalEnv<'a> {
    /// Values of thread-index specials.
    pub specials: &'a HashMap<Special, Scalar>,
    /// Reader for global inputs: `(gid, linear index) -> value`.
    pub globals: &'a dyn Fn(usize, i64) -> Scalar,
}

static NO_GLOBALS: fn(usize, i64) -> Scalar =
    |_, _| panic!("no globals during constant folding");

impl<'a> EvalEnv<'a> {
    /// An environment with no specials and no globals, for constant folding.
    pub fn empty() -> EvalEnv<'static> {
        static EMPTY: std::sync::OnceLock<HashMap<Special, Scalar>> = std::sync::OnceLock::new();
        EvalEnv { specials: EMPTY.get_or_init(HashMap::new), globals: &NO_GLOBALS }
    }
}

fn eval_unary(op: &AluOp, dtype: DType, v: Scalar) -> Scalar {
    use crate::backend::wasm::softmath;
    if dtype == DType::Float64 {
        let x = v.as_f64();
        let r = match op {
            AluOp::Neg => -x,
            AluOp::Recip => 1.0 / x,
            AluOp::Sqrt => x.sqrt(),
            AluOp::Abs => x.abs(),
            AluOp::Exp => x.exp(),
            AluOp::Log => x.ln(),
            AluOp::Sin => x.sin(),
            AluOp::Cos => x.cos(),
            AluOp::Tan => x.tan(),
            AluOp::Atan => x.atan(),
            AluOp::Asin => x.asin(),
            AluOp::Erf => softmath::erf_f64(x),
            AluOp::Erfc => 1.0 - softmath::erf_f64(x),
            _ => unreachable!(),
        };
        return Scalar::F64(r);
    }
    if dtype.is_float() {
        let x = v.as_f64() as f32;
        let r = match op {
            AluOp::Neg => -x,
            AluOp::Recip => 1.0 / x,
            AluOp::Sqrt => x.sqrt(),
            AluOp::Abs => x.abs(),
            AluOp::Exp => x.exp(),
            AluOp::Log => x.ln(),
            AluOp::Sin => x.sin(),
            AluOp::Cos => x.cos(),
            AluOp::Tan => x.tan(),
            AluOp::Atan => x.atan(),
            AluOp::Asin => x.asin(),
            AluOp::Erf => softmath::erf_f64(x as f64) as f32,
            AluOp::Erfc => (1.0 - softmath::erf_f64(x as f64)) as f32,
            _ => unreachable!(),
        };
        let s = Scalar::F32(r);
        return if dtype == DType::Float16 { s.cast(DType::Float16) } else { s };
    }
    match (op, v.cast(dtype)) {
        (AluOp::Neg, Scalar::I32(x)) => Scalar::I32(x.wrapping_neg()),
        (AluOp::Neg, Scalar::U32(x)) => Scalar::U32(x.wrapping_neg()),
        (AluOp::Abs, Scalar::I32(x)) => Scalar::I32(x.wrapping_abs()),
        (AluOp::Abs, Scalar::U32(x)) => Scalar::U32(x),
        (op, x) => panic!("unary {:?} not defined for {:?}", op, x),
    }
}

pub(crate) fn eval_binary(op: &AluOp, dtype: DType, a: Scalar, b: Scalar) -> Scalar {
    match op {
        AluOp::CmpEq => return Scalar::Bool(cmp_values(a, b) == Some(std::cmp::Ordering::Equal)),
        AluOp::CmpNe => {
            let o = cmp_values(a, b);
            return Scalar::Bool(o != Some(std::cmp::Ordering::Equal));
        }
        AluOp::CmpLt => return Scalar::Bool(cmp_values(a, b) == Some(std::cmp::Ordering::Less)),
        AluOp::CmpLe => {
            let o = cmp_values(a, b);
            return Scalar::Bool(matches!(
                o,
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            ));
        }
        AluOp::CmpGt => return Scalar::Bool(cmp_values(a, b) == Some(std::cmp::Ordering::Greater)),
        AluOp::CmpGe => {
            let o = cmp_values(a, b);
            return Scalar::Bool(matches!(
                o,
                Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
            ));
        }
        _ => {}
    }
    match dtype {
        DType::Float64 => {
            let (x, y) = (a.as_f64(), b.as_f64());
            Scalar::F64(match op {
                AluOp::Add => x + y,
                AluOp::Sub => x - y,
                AluOp::Mul => x * y,
                AluOp::Div => x / y,
                AluOp::IDiv => (x / y).floor(),
                AluOp::Mod => x % y,
                AluOp::Min => x.min(y),
                AluOp::Max => x.max(y),
                AluOp::Pow => x.powf(y),
                _ => panic!("binary {:?} not defined for float64", op),
            })
        }
        DType::Float16 | DType::Float32 => {
            let (x, y) = (a.as_f64() as f32, b.as_f64() as f32);
            let r = Scalar::F32(match op {
                AluOp::Add => x + y,
                AluOp::Sub => x - y,
                AluOp::Mul => x * y,
                AluOp::Div => x / y,
                AluOp::IDiv => (x / y).floor(),
                AluOp::Mod => x % y,
                AluOp::Min => x.min(y),
                AluOp::Max => x.max(y),
                AluOp::Pow => x.powf(y),
                _ => panic!("binary {:?} not defined for float", op),
            });
            if dtype == DType::Float16 {
                r.cast(DType::Float16)
            } else {
                r
            }
        }
        DType::Int32 => {
            let (x, y) = (a.cast(DType::Int32).as_i64() as i32, b.cast(DType::Int32).as_i64() as i32);
            Scalar::I32(match op {
                AluOp::Add => x.wrapping_add(y),
                AluOp::Sub => x.wrapping_sub(y),
                AluOp::Mul => x.wrapping_mul(y),
                AluOp::Div | AluOp::IDiv => x.div_euclid(y),
                AluOp::Mod => x.rem_euclid(y),
                AluOp::Min => x.min(y),
                AluOp::Max => x.max(y),
                AluOp::Pow => (x as f64).powf(y as f64) as i32,
                _ => panic!("binary {:?} not defined for int32", op),
            })
        }
        DType::Uint32 => {
            let (x, y) = (
                a.cast(DType::Uint32).as_i64() as u32,
                b.cast(DType::Uint32).as_i64() as u32,
            );
            Scalar::U32(match op {
                AluOp::Add => x.wrapping_add(y),
                AluOp::Sub => x.wrapping_sub(y),
                AluOp::Mul => x.wrapping_mul(y),
                AluOp::Div | AluOp::IDiv => x / y,
                AluOp::Mod => x % y,
                AluOp::Min => x.min(y),
                AluOp::Max => x.max(y),
                AluOp::Pow => (x as f64).powf(y as f64) as u32,
                _ => panic!("binary {:?} not defined for uint32", op),
            })
        }
        DType::Bool => panic!("binary {:?} not defined for bool", op),
    }
}

fn cmp_values(a: Scalar, b: Scalar) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Scalar::I32(x), Scalar::I32(y)) => Some(x.cmp(&y)),
        (Scalar::U32(x), Scalar::U32(y)) => Some(x.cmp(&y)),
        (Scalar::Bool(x), Scalar::Bool(y)) => Some(x.cmp(&y)),
        _ => a.as_f64().partial_cmp(&b.as_f64()),
    }
}

/// One bottom-up simplification step, applied by [`AluExp::simplify`].
fn simplify_step(e: &AluExp) -> Option<AluExp> {
    // Constant folding over pure ops.
    if !matches!(e.op(), AluOp::Const(_)) && e.is_const_tree() {
        let v = e.evaluate(&EvalEnv::empty());
        return Some(AluExp::constant(e.dtype(), v));
    }

    // Commutative canonicalization by child hash so structural equality
    // reveals common sub-expressions.
    if e.op().is_commutative() && e.src()[0].node_hash() > e.src()[1].node_hash() {
        return Some(AluExp::new(
            e.op().clone(),
            e.dtype(),
            vec![e.src()[1].clone(), e.src()[0].clone()],
        ));
    }

    let zero = || AluExp::constant(e.dtype(), Scalar::zero(e.dtype()));
    let one_of = |x: &AluExp| x.const_value() == Some(Scalar::one(e.dtype()));
    let zero_of = |x: &AluExp| x.const_value() == Some(Scalar::zero(e.dtype()));

    match e.op() {
        AluOp::Add => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if zero_of(a) {
                return Some(b.clone());
            }
            if zero_of(b) {
                return Some(a.clone());
            }
            // a*k + b*k -> (a+b)*k, the indexing workhorse.
            if let (AluOp::Mul, AluOp::Mul) = (a.op(), b.op()) {
                let (a0, a1) = (&a.src()[0], &a.src()[1]);
                let (b0, b1) = (&b.src()[0], &b.src()[1]);
                if a1.const_value().is_some() && a1 == b1 {
                    return Some(a0.add(b0).mul(a1));
                }
                if a0.const_value().is_some() && a0 == b0 {
                    return Some(a1.add(b1).mul(a0));
                }
            }
            None
        }
        AluOp::Sub => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if zero_of(b) {
                return Some(a.clone());
            }
            if a == b {
                return Some(zero());
            }
            None
        }
        AluOp::Mul => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if one_of(a) {
                return Some(b.clone());
            }
            if one_of(b) {
                return Some(a.clone());
            }
            if zero_of(a) || zero_of(b) {
                return Some(zero());
            }
            None
        }
        AluOp::Div => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if one_of(b) {
                return Some(a.clone());
            }
            None
        }
        AluOp::IDiv => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if one_of(b) {
                return Some(a.clone());
            }
            // (x*k) / k -> x for positive constant k, either operand order.
            if let AluOp::Mul = a.op() {
                if matches!(b.const_value(), Some(Scalar::I32(k)) if k > 0) {
                    if a.src()[1] == *b {
                        return Some(a.src()[0].clone());
                    }
                    if a.src()[0] == *b {
                        return Some(a.src()[1].clone());
                    }
                }
            }
            None
        }
        AluOp::Mod => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if one_of(b) {
                return Some(zero());
            }
            // (x*k) % k -> 0 for positive constant k, either operand order.
            if let AluOp::Mul = a.op() {
                if matches!(b.const_value(), Some(Scalar::I32(k)) if k > 0)
                    && (a.src()[0] == *b || a.src()[1] == *b)
                {
                    return Some(zero());
                }
            }
            None
        }
        AluOp::Min | AluOp::Max => {
            let (a, b) = (&e.src()[0], &e.src()[1]);
            if a == b {
                return Some(a.clone());
            }
            None
        }
        AluOp::Neg => {
            if let AluOp::Neg = e.src()[0].op() {
                return Some(e.src()[0].src()[0].clone());
            }
            None
        }
        AluOp::Cast => {
            let x = &e.src()[0];
            if x.dtype() == e.dtype() {
                return Some(x.clone());
            }
            // Collapse cast chains that cannot change the value.
            if let AluOp::Cast = x.op() {
                let inner = &x.src()[0];
                let widening_float = x.dtype().is_float()
                    && e.dtype().is_float()
                    && x.dtype().byte_width() >= e.dtype().byte_width()
                    && x.dtype() != DType::Float16;
                let int_chain = x.dtype().is_int() && e.dtype().is_int() && inner.dtype().is_int();
                if widening_float || int_chain {
                    return Some(inner.cast(e.dtype()));
                }
            }
            None
        }
        AluOp::Where => {
            let (c, x, y) = (&e.src()[0], &e.src()[1], &e.src()[2]);
            if let Some(v) = c.const_value() {
                return Some(if v.as_bool() { x.clone() } else { y.clone() });
            }
            if x == y {
                return Some(x.clone());
            }
            // Flatten nested selects sharing a fallback branch: the inner
            // branch chain collapses into one conjunction.
            if let AluOp::Where = x.op() {
                let (c2, x2, y2) = (&x.src()[0], &x.src()[1], &x.src()[2]);
                if y2 == y && y.const_value().is_some() {
                    return Some(AluExp::select(&AluExp::and(c, c2), x2, y));
                }
            }
            None
        }
        _ => None,
    }
}

impl PartialEq for AluExp {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.0.hash != other.0.hash {
            return false;
        }
        self.0.op == other.0.op && self.0.dtype == other.0.dtype && self.0.src == other.0.src
    }
}

impl Eq for AluExp {}

impl Hash for AluExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl fmt::Debug for AluExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            AluOp::Const(c) => write!(f, "{:?}", c),
            AluOp::Special(kind, size) => write!(f, "{}[{}]", kind.name(), size),
            AluOp::GlobalIndex(gid) => write!(f, "g{}[{:?}]", gid, self.src()[0]),
            AluOp::GlobalView(gid, _) => write!(f, "g{}{:?}", gid, self.src()),
            op => {
                write!(f, "{:?}(", op)?;
                for (i, s) in self.src().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", s)?;
                }
                write!(f, ")")
            }
        }
    }
}

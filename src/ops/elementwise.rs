//! Element-wise operations, comparisons, selection, and casts.
//!
//! All of these fuse: two expression-backed operands produce one combined
//! expression with a deduplicated input list, still lazy.

use crate::alu::AluExp;
use crate::array::{merge_pending, merge_recipes, Array};
use crate::dtype::DType;
use crate::trace::{record, Primitive};
use crate::Shape;

/// Align shapes (NumPy broadcasting) and dtypes (promotion) of a pair.
fn align(lhs: &Array, rhs: &Array) -> (Array, Array) {
    let mut lhs = lhs.clone();
    let mut rhs = rhs.clone();
    if lhs.dtype() != rhs.dtype() {
        let target = DType::promote(lhs.dtype(), rhs.dtype());
        lhs = lhs.astype(target);
        rhs = rhs.astype(target);
    }
    if lhs.shape() != rhs.shape() {
        let target = Shape::new(lhs.shape().to_vec())
            .broadcast_with(&Shape::new(rhs.shape().to_vec()))
            .unwrap_or_else(|| {
                panic!("shapes {:?} and {:?} are not broadcastable", lhs.shape(), rhs.shape())
            });
        lhs = lhs.broadcast_to(target.as_slice());
        rhs = rhs.broadcast_to(target.as_slice());
    }
    (lhs, rhs)
}

/// Fuse a binary op over two same-shaped, same-dtyped operands.
fn fused_binary(
    prim: Primitive,
    f: impl Fn(&AluExp, &AluExp) -> AluExp,
    lhs: &Array,
    rhs: &Array,
    out_dtype: DType,
) -> Array {
    assert_eq!(lhs.shape(), rhs.shape(), "binary operands must have equal shapes");
    assert_eq!(lhs.dtype(), rhs.dtype(), "binary operands must have equal dtypes");
    assert_eq!(lhs.device(), rhs.device(), "binary operands must share a device");

    let lhs2 = lhs.realized_if_wide(rhs.input_count());
    let rhs2 = rhs.realized_if_wide(lhs2.input_count());
    let lr = lhs2.flat_recipe();
    let rr = rhs2.flat_recipe();
    let mut inputs = lr.inputs;
    let rexp = merge_recipes(&mut inputs, rr.inputs, &rr.exp);
    let exp = f(&lr.exp, &rexp);
    let out = Array::from_exp_parts(
        lhs.device(),
        out_dtype,
        lhs.shape(),
        exp,
        inputs,
        merge_pending(&[&lhs2, &rhs2]),
    );
    record(prim, &[lhs, rhs], &out);
    out
}

fn fused_unary(prim: Primitive, f: impl Fn(&AluExp) -> AluExp, x: &Array) -> Array {
    let xr = x.flat_recipe();
    let exp = f(&xr.exp);
    let out = Array::from_exp_parts(
        x.device(),
        exp.dtype(),
        x.shape(),
        exp,
        xr.inputs,
        merge_pending(&[x]),
    );
    record(prim, &[x], &out);
    out
}

macro_rules! binary_method {
    ($(#[$doc:meta])* $name:ident, $prim:ident, $alu:ident) => {
        $(#[$doc])*
        pub fn $name(&self, other: &Array) -> Array {
            let (a, b) = align(self, other);
            fused_binary(Primitive::$prim, |x, y| x.$alu(y), &a, &b, a.dtype())
        }
    };
}

macro_rules! compare_method {
    ($(#[$doc:meta])* $name:ident, $prim:ident, $alu:ident) => {
        $(#[$doc])*
        pub fn $name(&self, other: &Array) -> Array {
            let (a, b) = align(self, other);
            fused_binary(Primitive::$prim, |x, y| x.$alu(y), &a, &b, DType::Bool)
        }
    };
}

macro_rules! unary_method {
    ($(#[$doc:meta])* $name:ident, $prim:ident, $alu:ident) => {
        $(#[$doc])*
        pub fn $name(&self) -> Array {
            assert!(
                self.dtype().is_float(),
                concat!(stringify!($name), " requires a float dtype")
            );
            fused_unary(Primitive::$prim, |x| x.$alu(), self)
        }
    };
}

impl Array {
    binary_method!(
        /// Element-wise addition (with broadcasting).
        ///
        /// # Examples
        ///
        /// ```
        /// # use microjax::Array;
        /// let a = Array::from_vec(vec![1.0, 2.0], &[2]);
        /// let b = Array::from_vec(vec![3.0, 4.0], &[2]);
        /// assert_eq!(a.add(&b).to_vec(), vec![4.0, 6.0]);
        /// ```
        add, Add, add
    );
    binary_method!(
        /// Element-wise subtraction.
        sub, Sub, sub
    );
    binary_method!(
        /// Element-wise multiplication.
        mul, Mul, mul
    );
    binary_method!(
        /// Element-wise division.
        div, Div, div
    );
    binary_method!(
        /// Element-wise power.
        pow, Pow, pow
    );
    binary_method!(
        /// Element-wise minimum.
        minimum, Min, min
    );
    binary_method!(
        /// Element-wise maximum.
        maximum, Max, max
    );

    compare_method!(
        /// Element-wise equality, returning a Bool array.
        eq, Eq, cmp_eq
    );
    compare_method!(
        /// Element-wise inequality.
        ne, Ne, cmp_ne
    );
    compare_method!(
        /// Element-wise less-than.
        lt, Lt, cmp_lt
    );
    compare_method!(
        /// Element-wise less-or-equal.
        le, Le, cmp_le
    );
    compare_method!(
        /// Element-wise greater-than.
        gt, Gt, cmp_gt
    );
    compare_method!(
        /// Element-wise greater-or-equal.
        ge, Ge, cmp_ge
    );

    /// Element-wise negation.
    pub fn neg(&self) -> Array {
        fused_unary(Primitive::Neg, |x| x.neg(), self)
    }

    /// Element-wise absolute value.
    pub fn abs(&self) -> Array {
        fused_unary(Primitive::Abs, |x| x.unary_abs(), self)
    }

    unary_method!(
        /// Element-wise exponential.
        exp, Exp, unary_exp
    );
    unary_method!(
        /// Element-wise natural logarithm.
        log, Log, unary_log
    );
    unary_method!(
        /// Element-wise sine.
        sin, Sin, unary_sin
    );
    unary_method!(
        /// Element-wise cosine.
        cos, Cos, unary_cos
    );
    unary_method!(
        /// Element-wise tangent.
        tan, Tan, unary_tan
    );
    unary_method!(
        /// Element-wise arctangent.
        atan, Atan, unary_atan
    );
    unary_method!(
        /// Element-wise arcsine.
        asin, Asin, unary_asin
    );
    unary_method!(
        /// Element-wise square root.
        sqrt, Sqrt, unary_sqrt
    );
    unary_method!(
        /// Element-wise reciprocal.
        reciprocal, Recip, recip
    );
    unary_method!(
        /// Element-wise error function.
        erf, Erf, unary_erf
    );
    unary_method!(
        /// Element-wise complementary error function.
        erfc, Erfc, unary_erfc
    );

    /// `self * self`, as a composite.
    pub fn square(&self) -> Array {
        self.mul(self)
    }

    /// Add a scalar constant.
    pub fn add_scalar(&self, v: f64) -> Array {
        self.add(&Array::full(v, &[], self.dtype()))
    }

    /// Subtract a scalar constant.
    pub fn sub_scalar(&self, v: f64) -> Array {
        self.sub(&Array::full(v, &[], self.dtype()))
    }

    /// Multiply by a scalar constant.
    pub fn mul_scalar(&self, v: f64) -> Array {
        self.mul(&Array::full(v, &[], self.dtype()))
    }

    /// Divide by a scalar constant.
    pub fn div_scalar(&self, v: f64) -> Array {
        self.div(&Array::full(v, &[], self.dtype()))
    }

    /// Raise to a scalar power.
    pub fn pow_scalar(&self, v: f64) -> Array {
        self.pow(&Array::full(v, &[], self.dtype()))
    }

    /// Element-wise selection: `cond ? x : y`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::Array;
    /// let c = Array::from_vec_bool(vec![true, false], &[2]);
    /// let x = Array::from_vec(vec![1.0, 1.0], &[2]);
    /// let y = Array::from_vec(vec![2.0, 2.0], &[2]);
    /// assert_eq!(Array::where_(&c, &x, &y).to_vec(), vec![1.0, 2.0]);
    /// ```
    pub fn where_(cond: &Array, x: &Array, y: &Array) -> Array {
        assert_eq!(cond.dtype(), DType::Bool, "where condition must be bool");
        let (x2, y2) = align(x, y);
        let cond2 = if cond.shape() == x2.shape() {
            cond.clone()
        } else {
            cond.broadcast_to(x2.shape())
        };
        assert_eq!(cond2.shape(), x2.shape(), "where operands must broadcast together");
        assert_eq!(cond.device(), x.device(), "where operands must share a device");

        let c2 = cond2.realized_if_wide(x2.input_count() + y2.input_count());
        let cr = c2.flat_recipe();
        let xr = x2.flat_recipe();
        let yr = y2.flat_recipe();
        let mut inputs = cr.inputs;
        let xexp = merge_recipes(&mut inputs, xr.inputs, &xr.exp);
        let yexp = merge_recipes(&mut inputs, yr.inputs, &yr.exp);
        let exp = AluExp::select(&cr.exp, &xexp, &yexp);
        let out = Array::from_exp_parts(
            x2.device(),
            x2.dtype(),
            x2.shape(),
            exp,
            inputs,
            merge_pending(&[&c2, &x2, &y2]),
        );
        record(Primitive::Where, &[cond, &x2, &y2], &out);
        out
    }

    /// Cast to a different dtype.
    ///
    /// # Examples
    ///
    /// ```
    /// # use microjax::{Array, DType};
    /// let a = Array::from_vec(vec![1.5, 2.7], &[2]);
    /// assert_eq!(a.astype(DType::Int32).to_vec_i32(), vec![1, 2]);
    /// ```
    pub fn astype(&self, dtype: DType) -> Array {
        if dtype == self.dtype() {
            return self.clone();
        }
        fused_unary(Primitive::Cast(dtype), |x| x.cast(dtype), self)
    }
}

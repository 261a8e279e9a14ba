//! # microjax: a lazy, kernel-fusing array core
//!
//! Array programs record a typed ALU expression IR; realization fuses
//! element-wise chains (and a closing reduction) into single kernels,
//! a tuner picks the schedule, and one of three backends executes the
//! dispatches against refcounted buffers.
//!
//! ## Key features
//!
//! - **Lazy fusion**: element-wise chains become one kernel, one dispatch
//! - **Composable transformations**: `grad`, `vjp`, `jvp`, `vmap`, `jit`
//! - **Three backends**: reference CPU, a bytecode stack machine, WebGPU
//! - **Zero-copy movement**: reshape/transpose/slice/pad rewrite a shape
//!   tracker, never buffers
//!
//! ## Quick start
//!
//! ```
//! use microjax::{grad, Array, DType};
//!
//! let x = Array::arange(0.0, Some(8.0), 1.0, DType::Float32);
//! let y = x.add(&x).mul(&x.sub_scalar(1.0)); // still lazy: one kernel
//! assert_eq!(y.to_vec(), vec![-0.0, 0.0, 4.0, 12.0, 24.0, 40.0, 60.0, 84.0]);
//!
//! let df = grad(|x: &Array| x.mul(x).sum(None, false));
//! assert_eq!(df(&Array::from_vec(vec![3.0], &[1])).to_vec(), vec![6.0]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alu;
mod array;
pub mod backend;
pub mod buffer;
mod dtype;
mod error;
pub mod kernel;
pub mod ops;
pub mod random;
pub mod routines;
mod shape;
pub mod trace;
pub mod tracker;
pub mod tuner;

pub use array::Array;
pub use backend::{
    backend as get_backend, default_device, init, set_default_device, Device,
};
pub use dtype::{DType, Scalar};
pub use error::{Error, Result};
pub use ops::einsum;
pub use routines::{cholesky, solve_triangular};
pub use shape::Shape;
pub use trace::{grad, jit, jvp, value_and_grad, vjp, vmap, vmap2};

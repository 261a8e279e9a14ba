//! Tracing and program transformations.
//!
//! Primitive applications recorded by the ops surface become a [`Jaxpr`].
//! The transformations ([`jit`], [`vmap`], [`jvp`], [`vjp`]/[`grad`])
//! interpret that IR with different semantics.

pub mod fusion;
mod jaxpr;
mod jit;
mod jvp;
mod primitive;
mod tracer;
mod vjp;
mod vmap;

pub use jaxpr::{Atom, Aval, Eqn, Jaxpr, VarId};
pub use jit::{jit, JitFunction};
pub use jvp::jvp;
pub use primitive::Primitive;
pub use tracer::is_tracing;
pub(crate) use tracer::record;
pub use vjp::{grad, value_and_grad, vjp, VjpFn};
pub use vmap::{vmap, vmap2};

//! Array operations, grouped by family.
//!
//! Everything here is lazy: operations build ALU expressions or rewrite
//! shape trackers, and record a primitive application for the tracer.

mod creation;
mod elementwise;
mod linalg;
mod movement;
mod reduce;

pub use linalg::einsum;

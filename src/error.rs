//! Crate-wide error type.
//!
//! Usage errors on the array surface (shape/dtype/axis violations) panic at
//! the offending call. Everything that can fail at runtime (backend
//! initialization, allocation, compilation, dispatch, readback) flows
//! through [`Error`].

use crate::backend::BufferId;
use crate::Device;

/// Errors surfaced by backends and the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A buffer handle was used after its refcount reached zero.
    #[error("invalid buffer handle {0:?}: already freed")]
    InvalidHandle(BufferId),

    /// A backend was requested before `init` succeeded for it.
    #[error("backend {0} is not initialized")]
    Uninitialized(Device),

    /// The backend does not implement the requested operation.
    #[error("{device}: unsupported operation: {what}")]
    Unsupported {
        /// Backend that rejected the request
        device: Device,
        /// Description of the unsupported operation
        what: String,
    },

    /// A required device capability is missing (adapter, limits).
    #[error("capability error on {device}: {message}")]
    Capability {
        /// Backend reporting the missing capability
        device: Device,
        /// Backend-provided description
        message: String,
    },

    /// Buffer allocation failed.
    #[error("allocation of {bytes} bytes failed on {device}")]
    Alloc {
        /// Backend that failed to allocate
        device: Device,
        /// Requested size in bytes
        bytes: usize,
    },

    /// Generated code failed to validate or compile.
    ///
    /// Carries the offending source so the kernel can be diagnosed.
    #[error("compilation failed: {message}")]
    Compile {
        /// Compiler/validator message
        message: String,
        /// The generated source text
        source_text: String,
    },

    /// A routine rejected its operands.
    #[error("routine {name}: {message}")]
    Routine {
        /// Routine name
        name: &'static str,
        /// Description of the rejection
        message: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

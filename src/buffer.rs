//! RAII buffer handles over backend refcounts.

use crate::backend::{self, Backend, BufferId, Device};
use crate::dtype::DType;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// An owned reference to one backend buffer.
///
/// Cloning increments the backend refcount; dropping decrements it. When the
/// last handle (and any pending executable holding one) goes away, the
/// backend reclaims the storage.
pub struct BufferHandle {
    backend: Arc<dyn Backend>,
    id: BufferId,
    dtype: DType,
    len: usize,
}

impl BufferHandle {
    /// Allocate a fresh buffer with refcount 1.
    pub(crate) fn alloc(
        backend: Arc<dyn Backend>,
        len: usize,
        dtype: DType,
        init: Option<&[u8]>,
    ) -> Result<BufferHandle> {
        let id = backend.malloc(len, dtype, init)?;
        Ok(BufferHandle { backend, id, dtype, len })
    }

    /// Adopt an id the backend already counted for us (routine outputs).
    pub(crate) fn adopt(
        backend: Arc<dyn Backend>,
        id: BufferId,
        dtype: DType,
        len: usize,
    ) -> BufferHandle {
        BufferHandle { backend, id, dtype, len }
    }

    /// The backend buffer id.
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Element dtype.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The owning device.
    #[inline]
    pub fn device(&self) -> Device {
        self.backend.device()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Blocking read of the whole buffer as host-layout bytes.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.backend.read(self.id, 0, None)
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        self.backend.inc_ref(self.id).expect("clone of freed buffer");
        BufferHandle {
            backend: self.backend.clone(),
            id: self.id,
            dtype: self.dtype,
            len: self.len,
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Err(e) = self.backend.dec_ref(self.id) {
            log::warn!("buffer {:?} double-free: {}", self.id, e);
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferHandle({:?}, {}x{} on {})",
            self.id,
            self.len,
            self.dtype,
            self.device()
        )
    }
}

/// Allocate on a device, defaulting to the current default device.
pub(crate) fn alloc_on(
    device: Option<Device>,
    len: usize,
    dtype: DType,
    init: Option<&[u8]>,
) -> Result<BufferHandle> {
    BufferHandle::alloc(backend::backend(device)?, len, dtype, init)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_and_drop_balance_refcounts() {
        let backend = backend::backend(Some(Device::Cpu)).unwrap();
        let before = backend.allocated();
        {
            let a = BufferHandle::alloc(backend.clone(), 8, DType::Float32, None).unwrap();
            let b = a.clone();
            assert_eq!(a.id(), b.id());
            assert_eq!(backend.allocated(), before + 1);
        }
        assert_eq!(backend.allocated(), before);
    }

    #[test]
    fn test_read_roundtrip() {
        let backend = backend::backend(Some(Device::Cpu)).unwrap();
        let bytes: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let h = BufferHandle::alloc(backend, 2, DType::Float32, Some(&bytes)).unwrap();
        assert_eq!(h.read().unwrap(), bytes);
    }
}

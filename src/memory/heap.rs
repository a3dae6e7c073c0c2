//! Heap-backed (virtual) memory.

use super::{
    Allocator, AvMemory, HeapBlock, MemoryCore, MemoryType, VirtualAllocator, check_align,
    next_memory_name,
};
use super::sealed::{Internal, MemoryBackend};
use crate::error::{Error, Result};
use crate::parcel::MessageParcel;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Process-local memory on the heap.
///
/// This is the simplest backend. It has no descriptor and cannot be written
/// to a parcel; memory wrapped with [`from_raw_parts`](Self::from_raw_parts)
/// stays owned by the caller and is never freed here.
pub struct VirtualMemory {
    core: MemoryCore,
    base: NonNull<u8>,
    /// `None` for caller-owned memory.
    storage: Option<(Arc<VirtualAllocator>, HeapBlock)>,
}

impl VirtualMemory {
    /// Allocate `capacity` bytes plus alignment padding.
    ///
    /// The offset is the padding that makes `base + offset` a multiple of
    /// `align` (0 when `align` is 0).
    pub(crate) fn new(allocator: Arc<VirtualAllocator>, capacity: usize, align: usize) -> Result<Self> {
        check_align(align)?;
        let alloc_len = capacity
            .checked_add(align.saturating_sub(1))
            .ok_or_else(|| Error::InvalidParameter(format!("capacity {capacity} too large")))?;

        let block = allocator.alloc(alloc_len)?;
        let base = block.as_ptr();
        let addr = base.as_ptr() as usize;
        let offset = if align == 0 {
            0
        } else {
            addr.next_multiple_of(align) - addr
        };

        let mut core = MemoryCore::new(next_memory_name(MemoryType::Virtual), capacity, align);
        core.offset = offset;
        Ok(Self {
            core,
            base,
            storage: Some((allocator, block)),
        })
    }

    /// Wrap caller-managed memory.
    ///
    /// Requires `size <= capacity`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `capacity` bytes for the
    /// whole lifetime of the returned memory, and must not be accessed
    /// through other pointers while this memory reads or writes it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, capacity: usize, size: usize) -> Result<Self> {
        if size > capacity {
            return Err(Error::InvalidParameter(format!(
                "size {size} exceeds capacity {capacity}"
            )));
        }

        let mut core = MemoryCore::new(next_memory_name(MemoryType::Virtual), capacity, 0);
        core.size = size;
        Ok(Self {
            core,
            base: ptr,
            storage: None,
        })
    }

    /// Does this memory own (and free) its storage?
    pub fn owns_storage(&self) -> bool {
        self.storage.is_some()
    }
}

impl MemoryBackend for VirtualMemory {
    fn core(&self) -> &MemoryCore {
        &self.core
    }

    fn core_mut(&mut self, _: Internal) -> &mut MemoryCore {
        &mut self.core
    }

    fn base(&self) -> Option<NonNull<u8>> {
        Some(self.base)
    }

    fn write_payload(&self, _parcel: &mut MessageParcel) -> Result<()> {
        Err(Error::InvalidOperation(
            "virtual memory has no cross-process representation".into(),
        ))
    }
}

impl AvMemory for VirtualMemory {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Virtual
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        if let Some((allocator, block)) = self.storage.take() {
            if !allocator.free(block) {
                tracing::warn!(name = %self.core.name, "failed to free virtual memory");
            }
        }
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("core", &self.core)
            .field("owned", &self.owns_storage())
            .finish()
    }
}

// SAFETY: the storage is exclusively owned heap memory (or caller memory the
// caller promised to keep valid); mutation requires &mut self.
unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(capacity: usize, align: usize) -> VirtualMemory {
        VirtualMemory::new(Arc::new(VirtualAllocator::new()), capacity, align).unwrap()
    }

    #[test]
    fn test_virtual_memory_creation() {
        let memory = make(1024, 0);
        assert_eq!(memory.capacity(), 1024);
        assert_eq!(memory.size(), 0);
        assert_eq!(memory.offset(), 0);
        assert_eq!(memory.memory_type(), MemoryType::Virtual);
        assert!(memory.file_descriptor().is_none());
        assert!(memory.surface_buffer().is_none());
        assert!(memory.owns_storage());
    }

    #[test]
    fn test_virtual_memory_alignment() {
        for align in [1, 8, 64, 4096] {
            let memory = make(100, align);
            let addr = memory.addr().unwrap().as_ptr() as usize;
            assert_eq!(addr % align, 0);
            assert!(memory.offset() < align);
        }
    }

    #[test]
    fn test_virtual_memory_bad_alignment() {
        assert!(VirtualMemory::new(Arc::new(VirtualAllocator::new()), 100, 3).is_err());
    }

    #[test]
    fn test_virtual_memory_append_and_read() {
        let mut memory = make(16, 0);
        assert_eq!(memory.write(b"hello ", None), 6);
        assert_eq!(memory.write(b"world", None), 5);
        assert_eq!(memory.size(), 11);

        let mut out = [0u8; 32];
        assert_eq!(memory.read(&mut out, None), 11);
        assert_eq!(&out[..11], b"hello world");
        assert_eq!(memory.as_slice().unwrap(), b"hello world");
    }

    #[test]
    fn test_virtual_memory_write_truncates() {
        let mut memory = make(8, 0);
        assert_eq!(memory.write(b"0123456789", None), 8);
        assert_eq!(memory.size(), 8);
        assert_eq!(memory.write(b"x", None), 0);
        assert_eq!(memory.size(), 8);
    }

    #[test]
    fn test_virtual_memory_positioned_write_shrinks_size() {
        let mut memory = make(16, 0);
        memory.write(b"0123456789", None);
        assert_eq!(memory.write(b"ab", Some(2)), 2);
        assert_eq!(memory.size(), 4);
        assert_eq!(memory.as_slice().unwrap(), b"01ab");
    }

    #[test]
    fn test_virtual_memory_read_from_position() {
        let mut memory = make(16, 0);
        memory.write(b"abcdef", None);
        let mut out = [0u8; 4];
        assert_eq!(memory.read(&mut out, Some(4)), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(memory.read(&mut out, Some(100)), 0);
    }

    #[test]
    fn test_virtual_memory_set_size_clamps() {
        let mut memory = make(64, 0);
        memory.set_size(-5);
        assert_eq!(memory.size(), 0);
        memory.set_size(65);
        assert_eq!(memory.size(), 64);
        memory.set_size(10);
        assert_eq!(memory.size(), 10);
        memory.set_size(i64::MAX);
        assert_eq!(memory.size(), 64);
    }

    #[test]
    fn test_virtual_memory_reset_idempotent() {
        let mut memory = make(64, 16);
        memory.write(b"data", None);
        let addr = memory.addr();
        memory.reset();
        assert_eq!(memory.size(), 0);
        memory.reset();
        assert_eq!(memory.size(), 0);
        assert_eq!(memory.addr(), addr);
        assert_eq!(memory.capacity(), 64);
    }

    #[test]
    fn test_virtual_memory_cannot_serialize() {
        let memory = make(64, 0);
        let mut parcel = MessageParcel::new();
        assert!(memory.write_to_parcel(&mut parcel).is_err());
        assert_eq!(parcel.data_len(), 0);
    }

    #[test]
    fn test_virtual_memory_from_raw_parts() {
        let mut backing = vec![7u8; 32];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        {
            let mut memory = unsafe { VirtualMemory::from_raw_parts(ptr, 32, 4) }.unwrap();
            assert!(!memory.owns_storage());
            assert_eq!(memory.as_slice().unwrap(), &[7, 7, 7, 7]);
            memory.write(b"zz", Some(0));
        }
        // Caller memory survives the wrapper.
        assert_eq!(&backing[..3], &[b'z', b'z', 7]);
    }

    #[test]
    fn test_virtual_memory_from_raw_parts_rejects_size() {
        let mut backing = vec![0u8; 8];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        assert!(unsafe { VirtualMemory::from_raw_parts(ptr, 8, 9) }.is_err());
    }

    #[test]
    fn test_virtual_memory_sync_unimplemented() {
        let memory = make(8, 0);
        assert!(matches!(memory.sync_start(), Err(Error::Unimplemented(_))));
    }
}

//! Shared memory using Linux memfd.
//!
//! The memory is mapped on first access. A parcel carries a duplicate of the
//! descriptor, so the receiving side maps the same physical pages into its
//! own address range.

use super::mapping::{LazyMapping, Mapping, check_fd_len};
use super::{
    Allocator, AvMemory, MemoryCore, MemoryFlag, MemoryType, SharedAllocator, defaults,
    next_memory_name,
};
use super::sealed::{Internal, MemoryBackend};
use crate::error::{Error, Result};
use crate::parcel::MessageParcel;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Memory backed by an anonymous memfd.
///
/// The creating process maps it read/write; processes that reconstruct it
/// from a parcel map it with the rights of its [`MemoryFlag`].
pub struct SharedMemory {
    core: MemoryCore,
    /// Always `Some` until drop.
    fd: Option<OwnedFd>,
    flag: MemoryFlag,
    access: MemoryFlag,
    mapping: LazyMapping,
    /// `None` when reconstructed from a parcel.
    allocator: Option<Arc<SharedAllocator>>,
}

impl SharedMemory {
    /// Allocate a new memfd of `capacity` bytes.
    ///
    /// Mappings are page-aligned, so any `align` up to the page size needs
    /// no padding; larger alignments are rejected.
    pub(crate) fn new(allocator: Arc<SharedAllocator>, capacity: usize, align: usize) -> Result<Self> {
        if align > defaults::page_size() {
            return Err(Error::InvalidParameter(format!(
                "shared memory alignment {align} exceeds the page size"
            )));
        }

        let fd = allocator.alloc(capacity)?;
        Ok(Self {
            core: MemoryCore::new(next_memory_name(MemoryType::Shared), capacity, align),
            fd: Some(fd),
            flag: allocator.memory_flag(),
            access: MemoryFlag::READ_WRITE,
            mapping: LazyMapping::new(),
            allocator: Some(allocator),
        })
    }

    /// Rebuild from a parcel payload (descriptor + flag) after its header.
    pub(crate) fn from_parcel(core: MemoryCore, parcel: &mut MessageParcel) -> Result<Self> {
        let fd = parcel.read_file_descriptor()?;
        let flag = MemoryFlag::from_wire(parcel.read_u32()?)?;
        check_fd_len(fd.as_fd(), core.capacity + core.offset)?;

        tracing::debug!(
            name = %core.name,
            fd = fd.as_raw_fd(),
            capacity = core.capacity,
            ?flag,
            "reconstructed shared memory"
        );
        Ok(Self {
            core,
            fd: Some(fd),
            flag,
            access: flag,
            mapping: LazyMapping::new(),
            allocator: None,
        })
    }

    fn map_len(&self) -> usize {
        self.core.capacity + self.core.offset
    }
}

impl MemoryBackend for SharedMemory {
    fn core(&self) -> &MemoryCore {
        &self.core
    }

    fn core_mut(&mut self, _: Internal) -> &mut MemoryCore {
        &mut self.core
    }

    fn base(&self) -> Option<NonNull<u8>> {
        let fd = self.fd.as_ref()?;
        if self.map_len() == 0 {
            return None;
        }
        self.mapping
            .get_or_map(|| {
                tracing::debug!(name = %self.core.name, len = self.map_len(), "mapping shared memory");
                Mapping::map(fd.as_fd(), self.map_len(), self.access)
            })
            .inspect_err(|e| tracing::warn!(name = %self.core.name, "cannot map shared memory: {}", e))
            .ok()
    }

    fn write_payload(&self, parcel: &mut MessageParcel) -> Result<()> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("shared memory has no descriptor".into()))?;
        parcel.write_file_descriptor(fd)?;
        parcel.write_u32(self.flag.bits());
        Ok(())
    }
}

impl AvMemory for SharedMemory {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Shared
    }

    fn access(&self) -> MemoryFlag {
        self.access
    }

    fn memory_flag(&self) -> MemoryFlag {
        self.flag
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        drop(self.mapping.take());
        let Some(fd) = self.fd.take() else {
            return;
        };
        match self.allocator.take() {
            Some(allocator) => {
                if !allocator.free(fd) {
                    tracing::warn!(name = %self.core.name, "failed to free shared memory");
                }
            }
            None => drop(fd),
        }
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("core", &self.core)
            .field("fd", &self.fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("flag", &self.flag)
            .field("mapped", &self.mapping.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::read_memory_from_parcel;

    fn make(capacity: usize, flag: MemoryFlag) -> SharedMemory {
        SharedMemory::new(Arc::new(SharedAllocator::new(flag)), capacity, 0).unwrap()
    }

    #[test]
    fn test_shared_memory_creation() {
        let memory = make(4096, MemoryFlag::READ_WRITE);
        assert_eq!(memory.capacity(), 4096);
        assert_eq!(memory.memory_type(), MemoryType::Shared);
        assert!(memory.file_descriptor().is_some());
        assert!(memory.mapping.get().is_none());
    }

    #[test]
    fn test_shared_memory_maps_lazily_once() {
        let memory = make(4096, MemoryFlag::READ_WRITE);
        let first = memory.addr().unwrap();
        assert!(memory.mapping.get().is_some());
        assert_eq!(memory.addr().unwrap(), first);
    }

    #[test]
    fn test_shared_memory_zero_capacity() {
        let mut memory = make(0, MemoryFlag::READ_WRITE);
        assert!(memory.addr().is_none());
        assert_eq!(memory.write(b"x", None), 0);
    }

    #[test]
    fn test_shared_memory_append_fills_megabyte() {
        const HALF: usize = 512 * 1024;
        let mut memory = make(2 * HALF, MemoryFlag::READ_WRITE);
        let first = vec![0x11u8; HALF];
        let second = vec![0x22u8; HALF];

        assert_eq!(memory.write(&first, None), HALF);
        assert_eq!(memory.write(&second, None), HALF);
        assert_eq!(memory.size(), 2 * HALF);

        let mut out = vec![0u8; 2 * HALF];
        assert_eq!(memory.read(&mut out, Some(0)), 2 * HALF);
        assert_eq!(&out[..HALF], &first[..]);
        assert_eq!(&out[HALF..], &second[..]);
    }

    #[test]
    fn test_shared_memory_rejects_huge_alignment() {
        let allocator = Arc::new(SharedAllocator::new(MemoryFlag::READ_WRITE));
        assert!(SharedMemory::new(allocator, 64, defaults::page_size() * 2).is_err());
    }

    #[test]
    fn test_shared_memory_owner_writes_read_only() {
        let mut memory = make(64, MemoryFlag::READ_ONLY);
        assert_eq!(memory.write(b"owner", None), 5);
        assert_eq!(memory.memory_flag(), MemoryFlag::READ_ONLY);
    }

    #[test]
    fn test_shared_memory_parcel_roundtrip_aliases() {
        let mut memory = make(4096, MemoryFlag::READ_WRITE);
        memory.write(b"shared bytes", None);

        let mut parcel = MessageParcel::new();
        memory.write_to_parcel(&mut parcel).unwrap();
        let mut remote = read_memory_from_parcel(&mut parcel).unwrap();

        assert_eq!(remote.memory_type(), MemoryType::Shared);
        assert_eq!(remote.name(), memory.name());
        assert_eq!(remote.size(), 12);
        assert_eq!(remote.as_slice().unwrap(), b"shared bytes");
        assert_ne!(
            remote.file_descriptor().unwrap().as_raw_fd(),
            memory.file_descriptor().unwrap().as_raw_fd()
        );

        remote.write(b"SHARED", Some(0));
        assert_eq!(&memory.as_slice().unwrap()[..6], b"SHARED");
    }

    #[test]
    fn test_shared_memory_remote_read_only() {
        let mut memory = make(64, MemoryFlag::READ_ONLY);
        memory.write(b"ro", None);

        let mut parcel = MessageParcel::new();
        memory.write_to_parcel(&mut parcel).unwrap();
        let mut remote = read_memory_from_parcel(&mut parcel).unwrap();

        assert_eq!(remote.access(), MemoryFlag::READ_ONLY);
        assert_eq!(remote.write(b"no", Some(0)), 0);
        let mut out = [0u8; 2];
        assert_eq!(remote.read(&mut out, None), 2);
        assert_eq!(&out, b"ro");
    }
}

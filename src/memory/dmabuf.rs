//! DMA-heap (hardware) memory.
//!
//! The descriptor is owned by the [`HardwareAllocator`]; the memory holds the
//! allocator and the base address it mapped. Secure buffers are never mapped
//! and never leave the process.
//!
//! # Example
//!
//! ```rust,ignore
//! use avbuffer::memory::{AllocatorFactory, MemoryFlag, create_memory};
//!
//! // From a DMA heap or V4L2 VIDIOC_EXPBUF
//! let allocator = AllocatorFactory::create_hardware_allocator(
//!     dma_fd.as_fd(), buffer_size, MemoryFlag::READ_WRITE, false,
//! )?;
//! let memory = create_memory(&allocator, 0, 0)?;
//! let data = memory.addr();
//! ```

use super::{Allocator, AvMemory, HardwareAllocator, MemoryCore, MemoryFlag, MemoryType};
use super::next_memory_name;
use super::sealed::{Internal, MemoryBackend};
use crate::error::{Error, Result};
use crate::parcel::MessageParcel;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Memory backed by a DMA-heap descriptor.
///
/// The mapping is made eagerly at construction with the protections of the
/// allocator's [`MemoryFlag`].
pub struct HardwareMemory {
    core: MemoryCore,
    allocator: Arc<HardwareAllocator>,
    base: Option<NonNull<u8>>,
}

impl HardwareMemory {
    /// Map the allocator's descriptor. Capacity is the declared buffer size.
    pub(crate) fn new(allocator: Arc<HardwareAllocator>) -> Result<Self> {
        let core = MemoryCore::new(next_memory_name(MemoryType::Hardware), allocator.capacity(), 0);
        Self::with_allocator(core, allocator)
    }

    /// Rebuild from a parcel payload (descriptor + flag) after its header.
    pub(crate) fn from_parcel(core: MemoryCore, parcel: &mut MessageParcel) -> Result<Self> {
        let fd = parcel.read_file_descriptor()?;
        let flag = MemoryFlag::from_wire(parcel.read_u32()?)?;
        let map_len = core.capacity + core.offset;
        let allocator = Arc::new(HardwareAllocator::from_owned(fd, map_len, flag, false)?);
        tracing::debug!(
            name = %core.name,
            fd = allocator.as_fd().as_raw_fd(),
            capacity = core.capacity,
            ?flag,
            "reconstructed hardware memory"
        );
        Self::with_allocator(core, allocator)
    }

    fn with_allocator(core: MemoryCore, allocator: Arc<HardwareAllocator>) -> Result<Self> {
        let base = if core.capacity + core.offset == 0 {
            None
        } else {
            allocator.alloc(core.capacity)?
        };
        Ok(Self {
            core,
            allocator,
            base,
        })
    }

    /// Secure memory is never CPU-addressable or transmitted.
    pub fn is_secure(&self) -> bool {
        self.allocator.is_secure()
    }
}

impl MemoryBackend for HardwareMemory {
    fn core(&self) -> &MemoryCore {
        &self.core
    }

    fn core_mut(&mut self, _: Internal) -> &mut MemoryCore {
        &mut self.core
    }

    fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    fn write_payload(&self, parcel: &mut MessageParcel) -> Result<()> {
        if self.is_secure() {
            return Err(Error::InvalidOperation(
                "secure hardware memory cannot be transmitted".into(),
            ));
        }
        parcel.write_file_descriptor(self.allocator.as_fd())?;
        parcel.write_u32(self.allocator.memory_flag().bits());
        Ok(())
    }
}

impl AvMemory for HardwareMemory {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Hardware
    }

    fn access(&self) -> MemoryFlag {
        self.allocator.memory_flag()
    }

    fn memory_flag(&self) -> MemoryFlag {
        self.allocator.memory_flag()
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.allocator.as_fd())
    }

    fn write_to_parcel(&self, parcel: &mut MessageParcel) -> Result<()> {
        // Checked up front so a secure buffer leaves the parcel untouched.
        if self.is_secure() {
            return Err(Error::InvalidOperation(
                "secure hardware memory cannot be transmitted".into(),
            ));
        }
        parcel.write_u8(MemoryType::Hardware.tag());
        self.core.write_to_parcel(parcel)?;
        self.write_payload(parcel)
    }
}

impl Drop for HardwareMemory {
    fn drop(&mut self) {
        if !self.allocator.free(self.base.take()) {
            tracing::warn!(name = %self.core.name, "failed to unmap hardware memory");
        }
    }
}

impl fmt::Debug for HardwareMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareMemory")
            .field("core", &self.core)
            .field("allocator", &self.allocator)
            .field("mapped", &self.base.is_some())
            .finish()
    }
}

// SAFETY: the allocator keeps the mapping alive until this memory frees its
// base on drop; mutation of its contents requires &mut self.
unsafe impl Send for HardwareMemory {}
unsafe impl Sync for HardwareMemory {}

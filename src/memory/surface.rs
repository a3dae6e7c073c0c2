//! Surface-buffer memory.

use super::{Allocator, AvMemory, MemoryCore, MemoryType, SurfaceAllocator, next_memory_name};
use super::sealed::{Internal, MemoryBackend};
use crate::error::{Error, Result};
use crate::parcel::MessageParcel;
use crate::surface::SurfaceBuffer;
use rustix::fd::BorrowedFd;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Memory backed by a [`SurfaceBuffer`].
///
/// Capacity is the surface's size, decided by its geometry. Mapping is
/// delegated to the surface buffer, which maps once on first access.
///
/// Three origins: a fresh allocation, a parcel, or an existing surface
/// buffer wrapped without any allocator.
pub struct SurfaceMemory {
    core: MemoryCore,
    surface: Arc<SurfaceBuffer>,
    /// `None` when reconstructed or wrapped.
    allocator: Option<Arc<SurfaceAllocator>>,
}

impl SurfaceMemory {
    pub(crate) fn new(allocator: Arc<SurfaceAllocator>) -> Result<Self> {
        let surface = allocator.alloc(0)?;
        let core = MemoryCore::new(next_memory_name(MemoryType::Surface), surface.size(), 0);
        Ok(Self {
            core,
            surface,
            allocator: Some(allocator),
        })
    }

    /// Wrap an existing surface buffer. The memory starts empty.
    pub fn from_surface_buffer(surface: Arc<SurfaceBuffer>) -> Self {
        let core = MemoryCore::new(next_memory_name(MemoryType::Surface), surface.size(), 0);
        Self {
            core,
            surface,
            allocator: None,
        }
    }

    /// Rebuild from a parcel payload: a length-prefixed surface marshal.
    pub(crate) fn from_parcel(core: MemoryCore, parcel: &mut MessageParcel) -> Result<Self> {
        let declared = parcel.read_u64()?;
        let start = parcel.read_position();
        let surface = SurfaceBuffer::read_from_parcel(parcel)?;
        let consumed = (parcel.read_position() - start) as u64;
        if consumed != declared {
            return Err(Error::InvalidData(format!(
                "surface payload declared {declared} bytes, read {consumed}"
            )));
        }
        if core.capacity + core.offset > surface.size() {
            return Err(Error::InvalidData(format!(
                "surface memory capacity {} exceeds surface size {}",
                core.capacity,
                surface.size()
            )));
        }

        tracing::debug!(
            name = %core.name,
            seq_num = surface.seq_num(),
            capacity = core.capacity,
            "reconstructed surface memory"
        );
        Ok(Self {
            core,
            surface,
            allocator: None,
        })
    }

    /// Rebuild from a bare surface marshal with no memory header.
    pub(crate) fn from_surface_parcel(parcel: &mut MessageParcel) -> Result<Self> {
        let surface = SurfaceBuffer::read_from_parcel(parcel)?;
        Ok(Self::from_surface_buffer(surface))
    }
}

impl MemoryBackend for SurfaceMemory {
    fn core(&self) -> &MemoryCore {
        &self.core
    }

    fn core_mut(&mut self, _: Internal) -> &mut MemoryCore {
        &mut self.core
    }

    fn base(&self) -> Option<NonNull<u8>> {
        self.surface
            .map()
            .inspect_err(|e| tracing::warn!(name = %self.core.name, "cannot map surface buffer: {}", e))
            .ok()
    }

    fn write_payload(&self, parcel: &mut MessageParcel) -> Result<()> {
        let len_at = parcel.data_len();
        parcel.write_u64(0);
        let start = parcel.data_len();
        self.surface.write_to_parcel(parcel)?;
        let len = (parcel.data_len() - start) as u64;
        parcel.patch_u64(len_at, len)
    }
}

impl AvMemory for SurfaceMemory {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Surface
    }

    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.surface.fd())
    }

    fn surface_buffer(&self) -> Option<&Arc<SurfaceBuffer>> {
        Some(&self.surface)
    }
}

impl Drop for SurfaceMemory {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            if !allocator.free(Arc::clone(&self.surface)) {
                tracing::warn!(name = %self.core.name, "failed to free surface buffer");
            }
        }
    }
}

impl fmt::Debug for SurfaceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceMemory")
            .field("core", &self.core)
            .field("surface", &self.surface)
            .field("allocated", &self.allocator.is_some())
            .finish()
    }
}

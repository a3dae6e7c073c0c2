//! Memory backends for avbuffer.
//!
//! This module provides the polymorphic backing-store layer underneath
//! [`AvBuffer`](crate::buffer::AvBuffer). Four backends share one contract:
//!
//! - [`VirtualMemory`]: process-local heap memory (never crosses a process boundary)
//! - [`SharedMemory`]: anonymous shared memory (memfd), mapped lazily
//! - [`SurfaceMemory`]: a graphics [`SurfaceBuffer`](crate::surface::SurfaceBuffer)
//! - [`HardwareMemory`]: a DMA-heap file descriptor, optionally secure
//!
//! # Architecture
//!
//! - [`Allocator`]: acquires and releases one category of backing storage
//! - [`AvMemory`]: capacity/size/offset bookkeeping, bounds-checked I/O and
//!   the type-specific parcel payload
//! - [`create_memory`] / [`read_memory_from_parcel`]: dispatch on [`MemoryType`]
//!
//! # Example
//!
//! ```rust,ignore
//! use avbuffer::memory::{AllocatorFactory, MemoryFlag, create_memory};
//!
//! let allocator = AllocatorFactory::create_shared_allocator(MemoryFlag::READ_WRITE);
//! let mut memory = create_memory(&allocator, 4096, 0)?;
//!
//! assert_eq!(memory.write(b"hello", None), 5);
//! let mut out = [0u8; 5];
//! assert_eq!(memory.read(&mut out, Some(0)), 5);
//! ```

mod allocator;
pub mod buffer_pool;
pub mod defaults;
mod dmabuf;
mod heap;
mod mapping;
mod shared;
mod surface;

pub use allocator::{
    Allocator, AllocatorFactory, AnyAllocator, HardwareAllocator, HeapBlock, SharedAllocator,
    SurfaceAllocator, VirtualAllocator,
};
pub use dmabuf::HardwareMemory;
pub use heap::VirtualMemory;
pub(crate) use mapping::{Mapping, check_fd_len};
pub use shared::SharedMemory;
pub use surface::SurfaceMemory;

use crate::error::{Error, Result};
use crate::parcel::MessageParcel;
use crate::surface::SurfaceBuffer;
use bitflags::bitflags;
use rustix::fd::BorrowedFd;
use rustix::mm::ProtFlags;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Category of backing memory.
///
/// A memory's type always matches the type of the allocator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemoryType {
    /// Process-local heap memory.
    Virtual = 0,
    /// Anonymous shared memory (memfd + mmap).
    Shared = 1,
    /// Graphics surface buffer.
    Surface = 2,
    /// DMA-heap buffer.
    Hardware = 3,
    /// Not a valid backing type.
    Unknown = 4,
}

impl MemoryType {
    /// Decode a wire tag. Unrecognised tags map to [`MemoryType::Unknown`].
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => MemoryType::Virtual,
            1 => MemoryType::Shared,
            2 => MemoryType::Surface,
            3 => MemoryType::Hardware,
            _ => MemoryType::Unknown,
        }
    }

    /// Wire tag for this type.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Can memory of this type be handed to another process?
    #[inline]
    pub fn supports_ipc(self) -> bool {
        matches!(
            self,
            MemoryType::Shared | MemoryType::Surface | MemoryType::Hardware
        )
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Virtual => "virtual",
            MemoryType::Shared => "shared",
            MemoryType::Surface => "surface",
            MemoryType::Hardware => "hardware",
            MemoryType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Access rights granted on shared and hardware memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlag: u32 {
        /// Mappable for reading.
        const READ_ONLY = 1 << 0;
        /// Mappable for writing.
        const WRITE_ONLY = 1 << 1;
        /// Mappable for reading and writing.
        const READ_WRITE = Self::READ_ONLY.bits() | Self::WRITE_ONLY.bits();
    }
}

impl Default for MemoryFlag {
    fn default() -> Self {
        MemoryFlag::READ_WRITE
    }
}

impl MemoryFlag {
    /// Decode a wire value, rejecting empty or unknown bit patterns.
    pub fn from_wire(bits: u32) -> Result<Self> {
        match MemoryFlag::from_bits(bits) {
            Some(flag) if !flag.is_empty() => Ok(flag),
            _ => Err(Error::InvalidData(format!("invalid memory flag {bits:#x}"))),
        }
    }

    /// Page protections for a mapping with these rights.
    pub fn prot_flags(self) -> ProtFlags {
        let mut prot = ProtFlags::empty();
        if self.contains(MemoryFlag::READ_ONLY) {
            prot |= ProtFlags::READ;
        }
        if self.contains(MemoryFlag::WRITE_ONLY) {
            prot |= ProtFlags::WRITE;
        }
        prot
    }

    /// Can data be read through a mapping with these rights?
    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(MemoryFlag::READ_ONLY)
    }

    /// Can data be written through a mapping with these rights?
    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(MemoryFlag::WRITE_ONLY)
    }
}

static MEMORY_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a debug name for a locally created memory.
pub(crate) fn next_memory_name(memory_type: MemoryType) -> String {
    let id = MEMORY_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{memory_type}-{id}", defaults::NAME_PREFIX)
}

/// Validate an alignment request (0 means "no alignment").
pub(crate) fn check_align(align: usize) -> Result<()> {
    if align != 0 && !align.is_power_of_two() {
        return Err(Error::InvalidParameter(format!(
            "alignment {align} is not a power of two"
        )));
    }
    Ok(())
}

/// Bookkeeping shared by every memory backend.
///
/// Invariant: `size <= capacity`. `offset` is the alignment padding applied
/// to the mapped base, fixed at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCore {
    pub(crate) name: String,
    pub(crate) capacity: usize,
    pub(crate) align: usize,
    pub(crate) offset: usize,
    pub(crate) size: usize,
}

impl MemoryCore {
    pub(crate) fn new(name: String, capacity: usize, align: usize) -> Self {
        Self {
            name,
            capacity,
            align,
            offset: 0,
            size: 0,
        }
    }

    /// Write the common header: name, capacity, align, offset, size.
    pub(crate) fn write_to_parcel(&self, parcel: &mut MessageParcel) -> Result<()> {
        parcel.write_string(&self.name);
        parcel.write_i32(to_wire_i32(self.capacity, "capacity")?);
        parcel.write_i32(to_wire_i32(self.align, "align")?);
        parcel.write_i32(to_wire_i32(self.offset, "offset")?);
        parcel.write_i32(to_wire_i32(self.size, "size")?);
        Ok(())
    }

    /// Read and validate the common header.
    ///
    /// Rejects negative fields, `size > capacity` and an offset larger than
    /// any alignment padding could produce.
    pub(crate) fn read_from_parcel(parcel: &mut MessageParcel) -> Result<Self> {
        let name = parcel.read_string()?;
        let capacity = parcel.read_i32()?;
        let align = parcel.read_i32()?;
        let offset = parcel.read_i32()?;
        let size = parcel.read_i32()?;

        if capacity < 0 || align < 0 || offset < 0 || size < 0 {
            return Err(Error::InvalidData(format!(
                "negative memory header field: capacity={capacity} align={align} \
                 offset={offset} size={size}"
            )));
        }
        if size > capacity {
            return Err(Error::InvalidData(format!(
                "memory size {size} exceeds capacity {capacity}"
            )));
        }
        let (capacity, align, offset, size) =
            (capacity as usize, align as usize, offset as usize, size as usize);
        check_align(align).map_err(|e| Error::InvalidData(e.to_string()))?;
        if offset > capacity + align {
            return Err(Error::InvalidData(format!(
                "memory offset {offset} exceeds capacity {capacity} + align {align}"
            )));
        }

        Ok(Self {
            name,
            capacity,
            align,
            offset,
            size,
        })
    }
}

mod sealed {
    use super::MemoryCore;
    use crate::error::Result;
    use crate::parcel::MessageParcel;
    use std::ptr::NonNull;

    /// Capability for mutating bookkeeping, constructible only in `memory`.
    #[derive(Debug, Clone, Copy)]
    pub struct Internal(pub(in crate::memory) ());

    /// Backend half of [`AvMemory`](super::AvMemory).
    pub trait MemoryBackend {
        /// Shared bookkeeping.
        fn core(&self) -> &MemoryCore;

        /// Shared bookkeeping, mutably.
        fn core_mut(&mut self, _: Internal) -> &mut MemoryCore;

        /// Mapped base address before the alignment offset.
        ///
        /// Must be valid for `offset + capacity` bytes while `self` lives.
        /// Shared and surface memory map lazily on the first call.
        fn base(&self) -> Option<NonNull<u8>>;

        /// Write the type-specific payload that follows the common header.
        fn write_payload(&self, parcel: &mut MessageParcel) -> Result<()>;
    }
}

use sealed::{Internal, MemoryBackend};

fn to_wire_i32(value: usize, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidOperation(format!("{field} {value} does not fit the wire format")))
}

/// Common contract of the four memory backends.
///
/// Write and read are best-effort: they truncate at the capacity (write) or
/// size (read) boundary and return the number of bytes actually copied. A
/// return of `0` covers empty input, an unmapped or inaccessible region and a
/// start position at the boundary; callers compare against the requested
/// length.
///
/// # Size policy
///
/// [`set_size`](AvMemory::set_size) clamps into `[0, capacity]` and always
/// succeeds.
///
/// The trait is sealed: the four backends in this module are its only
/// implementations, and their bookkeeping can only be changed through the
/// bounds-checked methods below.
///
/// ```compile_fail
/// use avbuffer::memory::{AvMemory, MemoryType};
///
/// #[derive(Debug)]
/// struct Outside;
///
/// impl AvMemory for Outside {
///     fn memory_type(&self) -> MemoryType {
///         MemoryType::Virtual
///     }
/// }
/// ```
///
/// ```compile_fail
/// use avbuffer::prelude::*;
///
/// let allocator = AllocatorFactory::create_virtual_allocator();
/// let mut small = create_memory(&allocator, 16, 0).unwrap();
/// let mut large = create_memory(&allocator, 1 << 20, 0).unwrap();
/// std::mem::swap(small.core_mut(), large.core_mut());
/// ```
pub trait AvMemory: MemoryBackend + Send + Sync + fmt::Debug {
    /// The backend type.
    fn memory_type(&self) -> MemoryType;

    /// Rights the local mapping was created with.
    fn access(&self) -> MemoryFlag {
        MemoryFlag::READ_WRITE
    }

    /// Rights granted to remote processes.
    fn memory_flag(&self) -> MemoryFlag {
        MemoryFlag::READ_WRITE
    }

    /// Descriptor backing this memory, if any.
    fn file_descriptor(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// The platform surface buffer for surface memory.
    fn surface_buffer(&self) -> Option<&Arc<SurfaceBuffer>> {
        None
    }

    /// Begin a CPU access window on device memory.
    fn sync_start(&self) -> Result<()> {
        Err(Error::Unimplemented("cache synchronization"))
    }

    /// End a CPU access window on device memory.
    fn sync_end(&self) -> Result<()> {
        Err(Error::Unimplemented("cache synchronization"))
    }

    /// Debug name.
    fn name(&self) -> &str {
        &self.core().name
    }

    /// Total usable bytes.
    fn capacity(&self) -> usize {
        self.core().capacity
    }

    /// Bytes currently holding valid data.
    fn size(&self) -> usize {
        self.core().size
    }

    /// Alignment padding applied to the base address.
    fn offset(&self) -> usize {
        self.core().offset
    }

    /// Requested alignment (0 for none).
    fn align(&self) -> usize {
        self.core().align
    }

    /// Start of the usable region (base + offset).
    fn addr(&self) -> Option<NonNull<u8>> {
        let base = self.base()?;
        // SAFETY: offset lies within the allocation made for capacity + padding.
        Some(unsafe { base.add(self.core().offset) })
    }

    /// Copy `data` into the memory.
    ///
    /// `None` appends at the current size; `Some(pos)` starts at
    /// `min(pos, capacity)`. The size becomes `start + written`, so an
    /// explicit position before the current size shrinks it.
    fn write(&mut self, data: &[u8], position: Option<usize>) -> usize {
        if data.is_empty() || !self.access().is_writable() {
            return 0;
        }
        let Some(addr) = self.addr() else {
            return 0;
        };
        let core = self.core();
        let start = match position {
            None => core.size,
            Some(pos) => pos.min(core.capacity),
        };
        let len = data.len().min(core.capacity - start);
        if len == 0 {
            return 0;
        }
        // SAFETY: [start, start + len) lies within [0, capacity) of the region.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr.as_ptr().add(start), len);
        }
        self.core_mut(Internal(())).size = start + len;
        len
    }

    /// Copy valid data out of the memory.
    ///
    /// `None` reads from the beginning; `Some(pos)` starts at `min(pos, size)`.
    fn read(&self, out: &mut [u8], position: Option<usize>) -> usize {
        if out.is_empty() || !self.access().is_readable() {
            return 0;
        }
        let Some(addr) = self.addr() else {
            return 0;
        };
        let size = self.core().size;
        let start = position.map_or(0, |pos| pos.min(size));
        let len = out.len().min(size - start);
        if len == 0 {
            return 0;
        }
        // SAFETY: [start, start + len) lies within [0, size) of the region.
        unsafe {
            std::ptr::copy_nonoverlapping(addr.as_ptr().add(start), out.as_mut_ptr(), len);
        }
        len
    }

    /// Set the valid-data length, clamped into `[0, capacity]`.
    fn set_size(&mut self, size: i64) {
        let core = self.core_mut(Internal(()));
        let capacity = core.capacity;
        core.size = usize::try_from(size.max(0)).map_or(capacity, |s| s.min(capacity));
    }

    /// Mark the memory empty. Capacity, offset and mapping are untouched.
    fn reset(&mut self) {
        self.core_mut(Internal(())).size = 0;
    }

    /// The valid data as a slice, or `None` if it is not CPU-readable.
    fn as_slice(&self) -> Option<&[u8]> {
        if !self.access().is_readable() {
            return None;
        }
        let addr = self.addr()?;
        // SAFETY: the region is mapped for at least `size` bytes while self lives.
        Some(unsafe { std::slice::from_raw_parts(addr.as_ptr(), self.core().size) })
    }

    /// Write type tag, common header and type payload.
    ///
    /// Fails before touching the parcel for memory that cannot cross a
    /// process boundary.
    fn write_to_parcel(&self, parcel: &mut MessageParcel) -> Result<()> {
        let memory_type = self.memory_type();
        if !memory_type.supports_ipc() {
            return Err(Error::InvalidOperation(format!(
                "{memory_type} memory cannot be transmitted"
            )));
        }
        parcel.write_u8(memory_type.tag());
        self.core().write_to_parcel(parcel)?;
        self.write_payload(parcel)
    }
}

/// Construct a memory through `allocator`, dispatching on its type.
///
/// `capacity` is ignored by surface allocators (geometry decides) and
/// hardware allocators (the descriptor's declared size decides).
pub fn create_memory(
    allocator: &AnyAllocator,
    capacity: usize,
    align: usize,
) -> Result<Box<dyn AvMemory>> {
    check_align(align)?;
    let memory: Box<dyn AvMemory> = match allocator {
        AnyAllocator::Virtual(a) => Box::new(VirtualMemory::new(Arc::clone(a), capacity, align)?),
        AnyAllocator::Shared(a) => Box::new(SharedMemory::new(Arc::clone(a), capacity, align)?),
        AnyAllocator::Surface(a) => Box::new(SurfaceMemory::new(Arc::clone(a))?),
        AnyAllocator::Hardware(a) => Box::new(HardwareMemory::new(Arc::clone(a))?),
    };
    debug_assert_eq!(memory.memory_type(), allocator.memory_type());
    tracing::debug!(
        name = memory.name(),
        memory_type = %memory.memory_type(),
        capacity = memory.capacity(),
        "created memory"
    );
    Ok(memory)
}

/// Reconstruct a memory from its type tag, common header and payload.
pub fn read_memory_from_parcel(parcel: &mut MessageParcel) -> Result<Box<dyn AvMemory>> {
    let memory_type = MemoryType::from_tag(parcel.read_u8()?);
    let core = MemoryCore::read_from_parcel(parcel)?;
    memory_from_payload(memory_type, core, parcel)
}

/// Build a memory aliasing the remote storage described by `core` + payload.
pub(crate) fn memory_from_payload(
    memory_type: MemoryType,
    core: MemoryCore,
    parcel: &mut MessageParcel,
) -> Result<Box<dyn AvMemory>> {
    let memory: Box<dyn AvMemory> = match memory_type {
        MemoryType::Shared => Box::new(SharedMemory::from_parcel(core, parcel)?),
        MemoryType::Surface => Box::new(SurfaceMemory::from_parcel(core, parcel)?),
        MemoryType::Hardware => Box::new(HardwareMemory::from_parcel(core, parcel)?),
        MemoryType::Virtual | MemoryType::Unknown => {
            return Err(Error::InvalidData(format!(
                "{memory_type} memory cannot be read from a parcel"
            )));
        }
    };
    Ok(memory)
}

/// Consume a type payload without acquiring anything it describes.
pub(crate) fn skip_payload(memory_type: MemoryType, parcel: &mut MessageParcel) -> Result<()> {
    match memory_type {
        MemoryType::Shared | MemoryType::Hardware => {
            parcel.skip_file_descriptor()?;
            MemoryFlag::from_wire(parcel.read_u32()?)?;
            Ok(())
        }
        MemoryType::Surface => {
            let len = parcel.read_u64()?;
            let len = usize::try_from(len)
                .map_err(|_| Error::InvalidData(format!("surface blob length {len}")))?;
            parcel.skip(len)
        }
        MemoryType::Virtual | MemoryType::Unknown => Err(Error::InvalidData(format!(
            "{memory_type} memory has no parcel payload"
        ))),
    }
}

//! Allocators for the four memory backends.
//!
//! An allocator acquires and releases one category of backing storage. It is
//! shared (`Arc`) with the memory it serves; the memory's drop is the single
//! place that calls [`Allocator::free`].

use super::mapping::{Mapping, check_fd_len};
use super::{MemoryFlag, MemoryType, defaults};
use crate::error::{Error, Result};
use crate::surface::{BufferRequestConfig, SurfaceBuffer};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::alloc::Layout;
use std::ffi::CString;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

/// Acquires and releases one category of backing memory.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Opaque handle to one allocation.
    type Handle;

    /// The memory type this allocator produces.
    fn memory_type(&self) -> MemoryType;

    /// Acquire storage for `capacity` bytes.
    fn alloc(&self, capacity: usize) -> Result<Self::Handle>;

    /// Release storage. Returns `false` if the handle did not belong to this
    /// allocator or could not be released cleanly; the handle is gone either way.
    fn free(&self, handle: Self::Handle) -> bool;
}

// ============================================================================
// Virtual
// ============================================================================

/// A zero-initialized heap block; deallocated on drop.
pub struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapBlock {
    /// Start of the block.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the block in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Returns true if the block has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: ptr was returned by alloc_zeroed with this layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBlock")
            .field("len", &self.layout.size())
            .finish()
    }
}

// SAFETY: the block is exclusively owned heap memory.
unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

/// Heap allocator for process-local memory.
#[derive(Debug, Default)]
pub struct VirtualAllocator;

impl VirtualAllocator {
    /// Create a heap allocator.
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for VirtualAllocator {
    type Handle = HeapBlock;

    fn memory_type(&self) -> MemoryType {
        MemoryType::Virtual
    }

    fn alloc(&self, capacity: usize) -> Result<HeapBlock> {
        let layout = Layout::from_size_align(capacity, 1)
            .map_err(|e| Error::InvalidParameter(format!("heap layout: {e}")))?;
        if capacity == 0 {
            return Ok(HeapBlock {
                ptr: NonNull::dangling(),
                layout,
            });
        }

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::NoMemory(format!("heap allocation of {capacity} bytes")))?;
        Ok(HeapBlock { ptr, layout })
    }

    fn free(&self, handle: HeapBlock) -> bool {
        drop(handle);
        true
    }
}

// ============================================================================
// Shared
// ============================================================================

/// Anonymous shared memory allocator (memfd).
///
/// The flag is the access granted to processes that receive the descriptor.
#[derive(Debug)]
pub struct SharedAllocator {
    flag: MemoryFlag,
}

impl SharedAllocator {
    /// Create a shared-memory allocator granting `flag` to remote mappers.
    pub fn new(flag: MemoryFlag) -> Self {
        Self { flag }
    }

    /// Rights granted to remote mappers.
    pub fn memory_flag(&self) -> MemoryFlag {
        self.flag
    }
}

impl Allocator for SharedAllocator {
    type Handle = OwnedFd;

    fn memory_type(&self) -> MemoryType {
        MemoryType::Shared
    }

    fn alloc(&self, capacity: usize) -> Result<OwnedFd> {
        let name = CString::new(defaults::NAME_PREFIX)
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::NoMemory(format!("memfd_create failed: {e}")))?;
        rustix::fs::ftruncate(&fd, capacity as u64)
            .map_err(|e| Error::NoMemory(format!("ftruncate to {capacity} failed: {e}")))?;
        tracing::debug!(fd = fd.as_raw_fd(), capacity, "allocated shared memory");
        Ok(fd)
    }

    fn free(&self, handle: OwnedFd) -> bool {
        tracing::debug!(fd = handle.as_raw_fd(), "released shared memory");
        drop(handle);
        true
    }
}

// ============================================================================
// Surface
// ============================================================================

/// Graphics surface allocator.
///
/// The capacity argument to [`alloc`](Allocator::alloc) is ignored: the
/// stored request geometry decides the size.
#[derive(Debug)]
pub struct SurfaceAllocator {
    config: BufferRequestConfig,
}

impl SurfaceAllocator {
    /// Create a surface allocator for `config`, validating the geometry.
    pub fn new(config: BufferRequestConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The requested geometry.
    pub fn config(&self) -> &BufferRequestConfig {
        &self.config
    }
}

impl Allocator for SurfaceAllocator {
    type Handle = Arc<SurfaceBuffer>;

    fn memory_type(&self) -> MemoryType {
        MemoryType::Surface
    }

    fn alloc(&self, _capacity: usize) -> Result<Arc<SurfaceBuffer>> {
        SurfaceBuffer::alloc(&self.config)
    }

    fn free(&self, handle: Arc<SurfaceBuffer>) -> bool {
        drop(handle);
        true
    }
}

// ============================================================================
// Hardware
// ============================================================================

/// DMA-heap allocator wrapping an already-open buffer descriptor.
///
/// The descriptor is duplicated on construction and owned until the
/// allocator is dropped. `alloc` maps it once and returns the cached base;
/// secure buffers are never mapped.
///
/// Every successful `alloc` must be paired with a `free` of the same base.
/// The mapping stays alive until the last outstanding base is freed.
pub struct HardwareAllocator {
    fd: OwnedFd,
    capacity: usize,
    flag: MemoryFlag,
    is_secure: bool,
    mapping: Mutex<Option<CachedMapping>>,
}

#[derive(Debug)]
struct CachedMapping {
    mapping: Mapping,
    users: usize,
}

impl HardwareAllocator {
    /// Wrap a duplicate of `fd`, declared to hold `capacity` bytes.
    ///
    /// Fails if the descriptor cannot be duplicated or is shorter than
    /// `capacity`.
    pub fn new(
        fd: BorrowedFd<'_>,
        capacity: usize,
        flag: MemoryFlag,
        is_secure: bool,
    ) -> Result<Self> {
        let fd = rustix::io::fcntl_dupfd_cloexec(fd, 0)
            .map_err(|e| Error::InvalidParameter(format!("cannot duplicate dma fd: {e}")))?;
        Self::from_owned(fd, capacity, flag, is_secure)
    }

    /// Take ownership of `fd` directly.
    pub(crate) fn from_owned(
        fd: OwnedFd,
        capacity: usize,
        flag: MemoryFlag,
        is_secure: bool,
    ) -> Result<Self> {
        if flag.is_empty() {
            return Err(Error::InvalidParameter("empty memory flag".into()));
        }
        check_fd_len(fd.as_fd(), capacity)?;
        Ok(Self {
            fd,
            capacity,
            flag,
            is_secure,
            mapping: Mutex::new(None),
        })
    }

    /// Declared size of the buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Access rights of the mapping and of remote mappers.
    pub fn memory_flag(&self) -> MemoryFlag {
        self.flag
    }

    /// Secure buffers are never CPU-addressable.
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }
}

impl AsFd for HardwareAllocator {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Allocator for HardwareAllocator {
    /// Mapped base, `None` for secure buffers.
    type Handle = Option<NonNull<u8>>;

    fn memory_type(&self) -> MemoryType {
        MemoryType::Hardware
    }

    fn alloc(&self, _capacity: usize) -> Result<Option<NonNull<u8>>> {
        if self.is_secure {
            return Ok(None);
        }

        let mut cached = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = cached.as_mut() {
            existing.users += 1;
            return Ok(Some(existing.mapping.as_ptr()));
        }
        let mapping = Mapping::map(self.fd.as_fd(), self.capacity, self.flag)?;
        let ptr = mapping.as_ptr();
        tracing::debug!(
            fd = self.fd.as_raw_fd(),
            capacity = self.capacity,
            "mapped hardware memory"
        );
        *cached = Some(CachedMapping { mapping, users: 1 });
        Ok(Some(ptr))
    }

    fn free(&self, handle: Option<NonNull<u8>>) -> bool {
        if self.is_secure {
            return true;
        }

        let Some(ptr) = handle else {
            return true;
        };
        let mut cached = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = match cached.as_mut() {
            Some(existing) if existing.mapping.as_ptr() == ptr => {
                existing.users -= 1;
                existing.users
            }
            _ => return false,
        };
        if remaining == 0 {
            *cached = None;
        }
        true
    }
}

impl fmt::Debug for HardwareAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareAllocator")
            .field("fd", &self.fd.as_raw_fd())
            .field("capacity", &self.capacity)
            .field("flag", &self.flag)
            .field("is_secure", &self.is_secure)
            .finish()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// One allocator of any backend, used to dispatch memory construction.
#[derive(Debug, Clone)]
pub enum AnyAllocator {
    /// Heap allocator.
    Virtual(Arc<VirtualAllocator>),
    /// Shared-memory allocator.
    Shared(Arc<SharedAllocator>),
    /// Surface allocator.
    Surface(Arc<SurfaceAllocator>),
    /// DMA-heap allocator.
    Hardware(Arc<HardwareAllocator>),
}

impl AnyAllocator {
    /// The memory type this allocator produces.
    pub fn memory_type(&self) -> MemoryType {
        match self {
            AnyAllocator::Virtual(a) => a.memory_type(),
            AnyAllocator::Shared(a) => a.memory_type(),
            AnyAllocator::Surface(a) => a.memory_type(),
            AnyAllocator::Hardware(a) => a.memory_type(),
        }
    }
}

/// Constructors for each allocator kind.
pub struct AllocatorFactory;

impl AllocatorFactory {
    /// Heap allocator.
    pub fn create_virtual_allocator() -> AnyAllocator {
        AnyAllocator::Virtual(Arc::new(VirtualAllocator::new()))
    }

    /// Shared-memory allocator granting `flag` to remote mappers.
    pub fn create_shared_allocator(flag: MemoryFlag) -> AnyAllocator {
        AnyAllocator::Shared(Arc::new(SharedAllocator::new(flag)))
    }

    /// Surface allocator for `config`.
    pub fn create_surface_allocator(config: BufferRequestConfig) -> Result<AnyAllocator> {
        Ok(AnyAllocator::Surface(Arc::new(SurfaceAllocator::new(config)?)))
    }

    /// DMA-heap allocator over a duplicate of `fd`.
    pub fn create_hardware_allocator(
        fd: BorrowedFd<'_>,
        capacity: usize,
        flag: MemoryFlag,
        is_secure: bool,
    ) -> Result<AnyAllocator> {
        Ok(AnyAllocator::Hardware(Arc::new(HardwareAllocator::new(
            fd, capacity, flag, is_secure,
        )?)))
    }
}

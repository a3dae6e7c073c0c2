//! Shared-mapping lifecycle helpers.

use super::MemoryFlag;
use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::MapFlags;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock, PoisonError};

/// An owned `MAP_SHARED` mapping of a descriptor; unmapped on drop.
#[derive(Debug)]
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Map `len` bytes of `fd` with the protections `flag` grants.
    pub(crate) fn map(fd: BorrowedFd<'_>, len: usize, flag: MemoryFlag) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidParameter("cannot map zero bytes".into()));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                flag.prot_flags(),
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| Error::InvalidOperation(format!("mmap of {len} bytes failed: {e}")))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::NoMemory("mmap returned null".into()))?;

        Ok(Self { ptr, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a live mapping created by `map`.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(len = self.len, "munmap failed: {}", e);
        }
    }
}

// SAFETY: the mapping is plain shared memory with no thread affinity.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Reject descriptors whose file is shorter than `len`.
///
/// Touching a shared mapping past the end of its file raises `SIGBUS`, so
/// every descriptor received or wrapped is checked before it is mapped.
pub(crate) fn check_fd_len(fd: BorrowedFd<'_>, len: usize) -> Result<()> {
    let stat = rustix::fs::fstat(fd)?;
    let file_len = usize::try_from(stat.st_size).unwrap_or(0);
    if file_len < len {
        return Err(Error::InvalidData(format!(
            "descriptor holds {file_len} bytes, {len} required"
        )));
    }
    Ok(())
}

/// A mapping created on first access, at most once, from any thread.
#[derive(Debug, Default)]
pub(crate) struct LazyMapping {
    cell: OnceLock<Mapping>,
    init: Mutex<()>,
}

impl LazyMapping {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current base address, without mapping.
    #[inline]
    pub(crate) fn get(&self) -> Option<NonNull<u8>> {
        self.cell.get().map(Mapping::as_ptr)
    }

    /// Return the mapping, creating it with `map` if this is the first access.
    pub(crate) fn get_or_map<F>(&self, map: F) -> Result<NonNull<u8>>
    where
        F: FnOnce() -> Result<Mapping>,
    {
        if let Some(ptr) = self.get() {
            return Ok(ptr);
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ptr) = self.get() {
            return Ok(ptr);
        }

        let _ = self.cell.set(map()?);
        self.get()
            .ok_or_else(|| Error::InvalidOperation("mapping vanished during init".into()))
    }

    /// Detach the mapping so it can be released in a chosen order.
    pub(crate) fn take(&mut self) -> Option<Mapping> {
        self.cell.take()
    }
}

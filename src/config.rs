//! Buffer allocation requests.

use crate::memory::{MemoryFlag, MemoryType};
use crate::surface::BufferRequestConfig;
use rustix::fd::{AsRawFd, OwnedFd};
use std::fmt;
use std::sync::Arc;

/// Describes a buffer: what was requested, and after allocation what was
/// realized.
///
/// The surface sub-config is always present, boxed, whether or not the
/// memory type uses it.
#[derive(Clone)]
pub struct BufferConfig {
    /// Requested size in bytes.
    pub size: usize,
    /// Requested alignment (power of two, 0 for none).
    pub align: usize,
    /// Backend to allocate from.
    pub memory_type: MemoryType,
    /// Access granted to remote processes (shared and hardware memory).
    pub memory_flag: MemoryFlag,
    /// Geometry for surface memory.
    pub surface_buffer_config: Box<BufferRequestConfig>,
    /// DMA-heap descriptor for hardware memory.
    pub dma_fd: Option<Arc<OwnedFd>>,
    /// Realized capacity, filled in after allocation.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 0,
            align: 0,
            memory_type: MemoryType::Unknown,
            memory_flag: MemoryFlag::READ_WRITE,
            surface_buffer_config: Box::default(),
            dma_fd: None,
            capacity: 0,
        }
    }
}

impl BufferConfig {
    /// Heap memory of `size` bytes.
    pub fn virtual_memory(size: usize) -> Self {
        Self {
            size,
            memory_type: MemoryType::Virtual,
            ..Default::default()
        }
    }

    /// Shared memory of `size` bytes granting `flag` to remote processes.
    pub fn shared_memory(size: usize, flag: MemoryFlag) -> Self {
        Self {
            size,
            memory_type: MemoryType::Shared,
            memory_flag: flag,
            ..Default::default()
        }
    }

    /// Surface memory of the given geometry.
    pub fn surface_memory(config: BufferRequestConfig) -> Self {
        Self {
            memory_type: MemoryType::Surface,
            surface_buffer_config: Box::new(config),
            ..Default::default()
        }
    }

    /// Hardware memory over a DMA-heap descriptor holding `size` bytes.
    pub fn hardware_memory(fd: OwnedFd, size: usize, flag: MemoryFlag) -> Self {
        Self {
            size,
            memory_type: MemoryType::Hardware,
            memory_flag: flag,
            dma_fd: Some(Arc::new(fd)),
            ..Default::default()
        }
    }

    /// Bytes a buffer described by this config can hold, counting
    /// alignment padding.
    ///
    /// An unrealized config will be allocated with `max(size, capacity)`
    /// bytes, so that is what it holds.
    fn usable_capacity(&self) -> usize {
        let capacity = self.size.max(self.capacity);
        if self.align == 0 {
            capacity
        } else {
            capacity.saturating_add(self.align - 1)
        }
    }

    /// The `<=` partial order: can a buffer described by `other` satisfy a
    /// request described by `self`?
    ///
    /// Types must match. Surface configs compare their geometry and usage
    /// (not the timeout). Other types need `self.size` to fit `other`'s
    /// capacity and compatible rights: equal flags, or `other` grants
    /// read/write. The order is reflexive for every config.
    pub fn fits_in(&self, other: &BufferConfig) -> bool {
        if self.memory_type != other.memory_type {
            return false;
        }
        match self.memory_type {
            MemoryType::Surface => self
                .surface_buffer_config
                .same_geometry(&other.surface_buffer_config),
            MemoryType::Virtual
            | MemoryType::Shared
            | MemoryType::Hardware
            | MemoryType::Unknown => {
                self.size <= other.usable_capacity()
                    && (self.memory_flag == other.memory_flag
                        || other.memory_flag == MemoryFlag::READ_WRITE)
            }
        }
    }
}

impl fmt::Debug for BufferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferConfig")
            .field("size", &self.size)
            .field("align", &self.align)
            .field("memory_type", &self.memory_type)
            .field("memory_flag", &self.memory_flag)
            .field("surface_buffer_config", &self.surface_buffer_config)
            .field("dma_fd", &self.dma_fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::PixelFormat;

    fn realized(mut config: BufferConfig, capacity: usize) -> BufferConfig {
        config.capacity = capacity;
        config
    }

    #[test]
    fn test_fits_in_reflexive_after_allocation() {
        let config = realized(BufferConfig::shared_memory(1024, MemoryFlag::READ_ONLY), 1024);
        assert!(config.fits_in(&config));
        let surface = BufferConfig::surface_memory(BufferRequestConfig::new(
            64,
            64,
            PixelFormat::Rgba8888,
        ));
        assert!(surface.fits_in(&surface));
    }

    #[test]
    fn test_fits_in_requires_same_type() {
        let virt = realized(BufferConfig::virtual_memory(16), 16);
        let shared = realized(BufferConfig::shared_memory(16, MemoryFlag::READ_WRITE), 16);
        assert!(!virt.fits_in(&shared));
        assert!(!shared.fits_in(&virt));
        assert!(!BufferConfig::default().fits_in(&virt));
    }

    #[test]
    fn test_fits_in_reflexive_before_allocation() {
        let configs = [
            BufferConfig::default(),
            BufferConfig::virtual_memory(100),
            BufferConfig::shared_memory(4096, MemoryFlag::READ_ONLY),
            BufferConfig::shared_memory(1, MemoryFlag::WRITE_ONLY),
        ];
        for config in &configs {
            assert!(config.fits_in(config), "{config:?}");
        }

        let mut aligned = BufferConfig::virtual_memory(100);
        aligned.align = 64;
        aligned.capacity = 40;
        assert!(aligned.fits_in(&aligned));
    }

    #[test]
    fn test_fits_in_size_and_alignment() {
        let request = BufferConfig::virtual_memory(100);
        let mut candidate = realized(BufferConfig::virtual_memory(0), 90);
        assert!(!request.fits_in(&candidate));
        candidate.align = 16;
        assert!(request.fits_in(&candidate));
        candidate.align = 8;
        assert!(!request.fits_in(&candidate));
    }

    #[test]
    fn test_fits_in_flag_compatibility() {
        let read_only = BufferConfig::shared_memory(8, MemoryFlag::READ_ONLY);
        let rw = realized(BufferConfig::shared_memory(8, MemoryFlag::READ_WRITE), 8);
        let wo = realized(BufferConfig::shared_memory(8, MemoryFlag::WRITE_ONLY), 8);
        assert!(read_only.fits_in(&rw));
        assert!(!read_only.fits_in(&wo));
        assert!(!realized(rw.clone(), 8).fits_in(&realized(read_only, 8)));
    }

    #[test]
    fn test_fits_in_surface_ignores_timeout() {
        let mut geometry = BufferRequestConfig::new(320, 240, PixelFormat::YCbCr420Sp);
        let a = BufferConfig::surface_memory(geometry.clone());
        geometry.timeout = 0;
        let b = BufferConfig::surface_memory(geometry.clone());
        assert!(a.fits_in(&b));
        geometry.width = 321;
        assert!(!a.fits_in(&BufferConfig::surface_memory(geometry)));
    }

    #[test]
    fn test_clone_keeps_boxed_surface_config() {
        let a = BufferConfig::surface_memory(BufferRequestConfig::new(2, 2, PixelFormat::Rgb565));
        let b = a.clone();
        assert_eq!(a.surface_buffer_config, b.surface_buffer_config);
    }
}

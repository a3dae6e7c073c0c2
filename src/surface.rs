//! Graphics surface buffers.
//!
//! A [`SurfaceBuffer`] is a memfd-backed image buffer with a fixed geometry
//! described by a [`BufferRequestConfig`]. It owns its mapping lifecycle and
//! its own parcel marshalling; shared ownership (`Arc`) is its reference
//! count.
//!
//! # Example
//!
//! ```rust,ignore
//! use avbuffer::surface::{BufferRequestConfig, PixelFormat, SurfaceBuffer};
//!
//! let config = BufferRequestConfig::new(1920, 1080, PixelFormat::Rgba8888);
//! let surface = SurfaceBuffer::alloc(&config)?;
//! assert_eq!(surface.stride(), 1920 * 4);
//! let addr = surface.map()?;
//! ```

use crate::error::{Error, Result};
use crate::memory::defaults::{self, align_up};
use crate::memory::{Mapping, MemoryFlag, check_fd_len};
use crate::parcel::MessageParcel;
use bitflags::bitflags;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ffi::CString;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Pixel layouts a surface can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PixelFormat {
    /// 16-bit packed RGB.
    Rgb565 = 3,
    /// 32-bit RGBA.
    Rgba8888 = 12,
    /// 32-bit BGRA.
    Bgra8888 = 20,
    /// NV12: Y plane followed by interleaved CbCr at half resolution.
    YCbCr420Sp = 24,
    /// NV21: Y plane followed by interleaved CrCb at half resolution.
    YCrCb420Sp = 25,
}

impl PixelFormat {
    /// Decode a raw format code.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            3 => Some(PixelFormat::Rgb565),
            12 => Some(PixelFormat::Rgba8888),
            20 => Some(PixelFormat::Bgra8888),
            24 => Some(PixelFormat::YCbCr420Sp),
            25 => Some(PixelFormat::YCrCb420Sp),
            _ => None,
        }
    }

    /// Raw format code.
    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Bytes per pixel of the first plane.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => 4,
            PixelFormat::YCbCr420Sp | PixelFormat::YCrCb420Sp => 1,
        }
    }

    /// Row count including chroma rows for semi-planar formats.
    fn total_rows(self, height: usize) -> usize {
        match self {
            PixelFormat::YCbCr420Sp | PixelFormat::YCrCb420Sp => height + height.div_ceil(2),
            _ => height,
        }
    }
}

bitflags! {
    /// How a surface buffer will be accessed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u64 {
        /// Read by the CPU.
        const CPU_READ = 1 << 0;
        /// Written by the CPU.
        const CPU_WRITE = 1 << 1;
        /// Backed by a media memory zone.
        const MEM_MMZ = 1 << 2;
        /// Backed by DMA memory.
        const MEM_DMA = 1 << 3;
        /// Used as a video encoder input.
        const VIDEO_ENCODER = 1 << 16;
        /// Used as a video decoder output.
        const VIDEO_DECODER = 1 << 22;
    }
}

/// Requested geometry of a surface buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferRequestConfig {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row stride alignment in bytes (power of two, 0 for none).
    pub stride_alignment: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Intended access.
    pub usage: BufferUsage,
    /// Dequeue timeout in milliseconds; not part of the geometry.
    pub timeout: i32,
}

impl Default for BufferRequestConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            stride_alignment: defaults::SURFACE_STRIDE_ALIGNMENT,
            format: PixelFormat::Rgba8888,
            usage: BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::MEM_DMA,
            timeout: defaults::SURFACE_TIMEOUT_MS,
        }
    }
}

impl BufferRequestConfig {
    /// Geometry with default alignment, usage and timeout.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    /// Check the geometry can be allocated.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidParameter(format!(
                "surface geometry {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.stride_alignment != 0 && !self.stride_alignment.is_power_of_two() {
            return Err(Error::InvalidParameter(format!(
                "stride alignment {} is not a power of two",
                self.stride_alignment
            )));
        }
        self.layout().map(|_| ())
    }

    /// Equality of the five geometry/usage fields, ignoring the timeout.
    pub fn same_geometry(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.stride_alignment == other.stride_alignment
            && self.format == other.format
            && self.usage == other.usage
    }

    /// Row stride and total size in bytes.
    fn layout(&self) -> Result<(usize, usize)> {
        let width = self.width as usize;
        let row = width
            .checked_mul(self.format.bytes_per_pixel())
            .ok_or_else(|| Error::InvalidParameter("surface row overflows".into()))?;
        let stride = align_up(row, self.stride_alignment as usize);
        let size = stride
            .checked_mul(self.format.total_rows(self.height as usize))
            .filter(|&size| size <= i32::MAX as usize)
            .ok_or_else(|| Error::InvalidParameter("surface size overflows".into()))?;
        Ok((stride, size))
    }
}

static SURFACE_SEQ: AtomicU32 = AtomicU32::new(1);

/// A memfd-backed graphics buffer.
pub struct SurfaceBuffer {
    fd: OwnedFd,
    config: BufferRequestConfig,
    stride: usize,
    size: usize,
    seq_num: u32,
    mapping: Mutex<Option<Mapping>>,
}

impl SurfaceBuffer {
    /// Allocate a buffer for `config`.
    pub fn alloc(config: &BufferRequestConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (stride, size) = config.layout()?;

        let name = CString::new(format!("{}-surface", defaults::NAME_PREFIX))
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::NoMemory(format!("surface memfd_create failed: {e}")))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::NoMemory(format!("surface ftruncate to {size} failed: {e}")))?;

        let seq_num = SURFACE_SEQ.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            seq_num,
            width = config.width,
            height = config.height,
            stride,
            size,
            "allocated surface buffer"
        );
        Ok(Arc::new(Self {
            fd,
            config: config.clone(),
            stride,
            size,
            seq_num,
            mapping: Mutex::new(None),
        }))
    }

    /// Map the buffer into this process, once. Returns the base address.
    pub fn map(&self) -> Result<NonNull<u8>> {
        let mut mapping = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = mapping.as_ref() {
            return Ok(existing.as_ptr());
        }
        let created = Mapping::map(self.fd.as_fd(), self.size, MemoryFlag::READ_WRITE)?;
        let ptr = created.as_ptr();
        *mapping = Some(created);
        Ok(ptr)
    }

    /// Release the mapping.
    ///
    /// # Safety
    ///
    /// No pointer obtained from [`map`](Self::map) or
    /// [`vir_addr`](Self::vir_addr) may be used afterwards.
    pub unsafe fn unmap(&self) {
        let mut mapping = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        *mapping = None;
    }

    /// Base address if currently mapped.
    pub fn vir_addr(&self) -> Option<NonNull<u8>> {
        let mapping = self.mapping.lock().unwrap_or_else(PoisonError::into_inner);
        mapping.as_ref().map(Mapping::as_ptr)
    }

    /// The backing descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.config.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.config.height
    }

    /// Pixel layout.
    pub fn format(&self) -> PixelFormat {
        self.config.format
    }

    /// Intended access.
    pub fn usage(&self) -> BufferUsage {
        self.config.usage
    }

    /// The geometry this buffer was allocated with.
    pub fn config(&self) -> &BufferRequestConfig {
        &self.config
    }

    /// Identity shared by every process holding this buffer.
    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    /// Marshal geometry, identity and a duplicate of the descriptor.
    pub fn write_to_parcel(&self, parcel: &mut MessageParcel) -> Result<()> {
        parcel.write_u32(self.seq_num);
        parcel.write_u32(self.config.width);
        parcel.write_u32(self.config.height);
        parcel.write_u32(self.config.stride_alignment);
        parcel.write_i32(self.config.format.raw());
        parcel.write_u64(self.config.usage.bits());
        parcel.write_i32(self.config.timeout);
        parcel.write_u64(self.stride as u64);
        parcel.write_u64(self.size as u64);
        parcel.write_file_descriptor(&self.fd)
    }

    /// Rebuild a buffer aliasing the marshalled one.
    pub fn read_from_parcel(parcel: &mut MessageParcel) -> Result<Arc<Self>> {
        let seq_num = parcel.read_u32()?;
        let width = parcel.read_u32()?;
        let height = parcel.read_u32()?;
        let stride_alignment = parcel.read_u32()?;
        let raw_format = parcel.read_i32()?;
        let usage = parcel.read_u64()?;
        let timeout = parcel.read_i32()?;
        let stride = parcel.read_u64()?;
        let size = parcel.read_u64()?;
        let fd = parcel.read_file_descriptor()?;

        let format = PixelFormat::from_raw(raw_format)
            .ok_or_else(|| Error::InvalidData(format!("unknown pixel format {raw_format}")))?;
        let config = BufferRequestConfig {
            width,
            height,
            stride_alignment,
            format,
            usage: BufferUsage::from_bits_retain(usage),
            timeout,
        };
        config
            .validate()
            .map_err(|e| Error::InvalidData(e.to_string()))?;
        let (expected_stride, expected_size) = config.layout()?;
        if stride != expected_stride as u64 || size != expected_size as u64 {
            return Err(Error::InvalidData(format!(
                "surface layout mismatch: stride {stride} size {size}, \
                 expected {expected_stride} {expected_size}"
            )));
        }
        check_fd_len(fd.as_fd(), expected_size)?;

        Ok(Arc::new(Self {
            fd,
            config,
            stride: expected_stride,
            size: expected_size,
            seq_num,
            mapping: Mutex::new(None),
        }))
    }
}

impl AsFd for SurfaceBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for SurfaceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceBuffer")
            .field("seq_num", &self.seq_num)
            .field("fd", &self.fd.as_raw_fd())
            .field("width", &self.config.width)
            .field("height", &self.config.height)
            .field("format", &self.config.format)
            .field("stride", &self.stride)
            .field("size", &self.size)
            .finish()
    }
}

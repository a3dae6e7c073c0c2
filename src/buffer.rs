//! Media buffers: timing attributes, metadata and an optional memory.
//!
//! An [`AvBuffer`] pairs per-frame attributes (timestamps, flags, [`Meta`])
//! with a backing [`AvMemory`]. A buffer without memory is "attributes
//! only" and still crosses a process boundary.
//!
//! # Wire layout
//!
//! ```text
//! uid: u64 | pts: i64 | dts: i64 | duration: i64 | flag: u32 | meta
//! attributes_only: bool
//! [memory type: u8 | common header | type payload]
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use avbuffer::prelude::*;
//!
//! let config = BufferConfig::shared_memory(4096, MemoryFlag::READ_WRITE);
//! let mut buffer = AvBuffer::from_config(&config)?;
//! buffer.pts = 33_000;
//! buffer.memory_mut().unwrap().write(b"frame", None);
//!
//! let mut parcel = MessageParcel::new();
//! buffer.write_to_parcel(&mut parcel)?;
//! parcel.send(&socket)?;
//! ```

use crate::config::BufferConfig;
use crate::error::{Error, Result};
use crate::memory::{
    AllocatorFactory, AnyAllocator, AvMemory, MemoryCore, MemoryType, SurfaceMemory,
    VirtualMemory, create_memory, memory_from_payload, skip_payload,
};
use crate::metadata::Meta;
use crate::parcel::MessageParcel;
use crate::surface::SurfaceBuffer;
use bitflags::bitflags;
use rustix::fd::AsFd;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// Per-frame buffer flags.
    ///
    /// Unknown bits are kept, so flags from a newer peer survive a relay.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Buffer marks end of stream.
        const EOS = 1 << 0;
        /// Buffer contains a sync point (keyframe).
        const SYNC_FRAME = 1 << 1;
        /// Buffer holds part of a frame.
        const PARTIAL_FRAME = 1 << 2;
        /// Buffer holds codec configuration data.
        const CODEC_DATA = 1 << 3;
        /// Buffer should be dropped without processing.
        const DISCARD = 1 << 4;
        /// Buffer is not referenced by later frames.
        const DISPOSABLE = 1 << 5;
    }
}

static UID_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Pack a timestamp, the process id and a rolling 16-bit counter.
///
/// Layout, high to low: the low 32 bits of the nanosecond wall clock, the
/// low 16 bits of the pid, the counter. The clock field wraps every ~4.3 s,
/// so two ids of one process collide only if they are drawn a whole number
/// of wrap periods apart with the same counter value. Zero means "not
/// generated" and is never returned.
fn generate_unique_id() -> u64 {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let clock = now_ns & u64::from(u32::MAX);
    let pid = u64::from(std::process::id() & 0xffff);
    let count = u64::from(UID_COUNTER.fetch_add(1, Ordering::Relaxed));
    ((clock << 32) | (pid << 16) | count).max(1)
}

/// A media buffer.
///
/// Attribute fields are public; memory and metadata go through accessors.
/// Wrap in `Arc` to share between pipeline stages.
pub struct AvBuffer {
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    /// Decode timestamp in microseconds.
    pub dts: i64,
    /// Duration in microseconds.
    pub duration: i64,
    /// Frame flags.
    pub flag: BufferFlags,
    uid: OnceLock<u64>,
    meta: Meta,
    memory: Option<Box<dyn AvMemory>>,
    config: BufferConfig,
}

impl AvBuffer {
    /// A buffer with attributes and metadata only.
    pub fn new() -> Self {
        Self {
            pts: 0,
            dts: 0,
            duration: 0,
            flag: BufferFlags::empty(),
            uid: OnceLock::new(),
            meta: Meta::new(),
            memory: None,
            config: BufferConfig::default(),
        }
    }

    fn with_memory(memory: Box<dyn AvMemory>, config: BufferConfig) -> Self {
        Self {
            memory: Some(memory),
            config,
            ..Self::new()
        }
    }

    /// Allocate a buffer as `config` describes.
    ///
    /// The capacity requested is `max(config.size, config.capacity)`. The
    /// stored config is back-filled with the realized capacity and flag.
    pub fn from_config(config: &BufferConfig) -> Result<Self> {
        let allocator = match config.memory_type {
            MemoryType::Virtual => AllocatorFactory::create_virtual_allocator(),
            MemoryType::Shared => AllocatorFactory::create_shared_allocator(config.memory_flag),
            MemoryType::Surface => AllocatorFactory::create_surface_allocator(
                (*config.surface_buffer_config).clone(),
            )?,
            MemoryType::Hardware => {
                let fd = config.dma_fd.as_ref().ok_or_else(|| {
                    Error::InvalidParameter("hardware buffer config has no dma fd".into())
                })?;
                AllocatorFactory::create_hardware_allocator(
                    fd.as_fd(),
                    config.size.max(config.capacity),
                    config.memory_flag,
                    false,
                )?
            }
            MemoryType::Unknown => {
                return Err(Error::InvalidParameter(
                    "buffer config has no memory type".into(),
                ));
            }
        };

        let capacity = config.size.max(config.capacity);
        let memory = create_memory(&allocator, capacity, config.align)?;
        let mut stored = config.clone();
        stored.capacity = memory.capacity();
        stored.memory_flag = memory.memory_flag();
        Ok(Self::with_memory(memory, stored))
    }

    /// Allocate `capacity` bytes aligned to `align` through `allocator`.
    pub fn from_allocator(allocator: &AnyAllocator, capacity: usize, align: usize) -> Result<Self> {
        let memory = create_memory(allocator, capacity, align)?;
        let mut config = config_from_memory(&*memory);
        config.size = capacity;
        Ok(Self::with_memory(memory, config))
    }

    /// Wrap caller-owned memory holding `size` valid bytes.
    ///
    /// The buffer never frees `ptr`.
    ///
    /// # Safety
    ///
    /// Same contract as [`VirtualMemory::from_raw_parts`].
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, capacity: usize, size: usize) -> Result<Self> {
        // SAFETY: forwarded to the caller.
        let memory = unsafe { VirtualMemory::from_raw_parts(ptr, capacity, size) }?;
        let config = config_from_memory(&memory);
        Ok(Self::with_memory(Box::new(memory), config))
    }

    /// Wrap an existing surface buffer.
    pub fn from_surface_buffer(surface: Arc<SurfaceBuffer>) -> Self {
        let memory = SurfaceMemory::from_surface_buffer(surface);
        let config = config_from_memory(&memory);
        Self::with_memory(Box::new(memory), config)
    }

    /// Reconstruct a buffer written by [`write_to_parcel`](Self::write_to_parcel).
    pub fn from_parcel(parcel: &mut MessageParcel) -> Result<Self> {
        let mut buffer = Self::new();
        buffer.read_from_parcel(parcel, false)?;
        Ok(buffer)
    }

    /// Process-unique identity, generated on first use.
    pub fn unique_id(&self) -> u64 {
        *self.uid.get_or_init(generate_unique_id)
    }

    /// The buffer's metadata.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The buffer's metadata, mutably.
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    /// Backing memory, `None` for an attributes-only buffer.
    pub fn memory(&self) -> Option<&dyn AvMemory> {
        self.memory.as_deref()
    }

    /// Backing memory, mutably.
    pub fn memory_mut(&mut self) -> Option<&mut (dyn AvMemory + 'static)> {
        self.memory.as_deref_mut()
    }

    /// Does this buffer carry attributes only?
    pub fn is_attributes_only(&self) -> bool {
        self.memory.is_none()
    }

    /// The buffer's shape.
    ///
    /// Without memory this is the stored request. With memory, size,
    /// capacity, alignment and flag (and surface geometry) are read back from
    /// the live memory, which may differ from what was requested.
    pub fn config(&self) -> BufferConfig {
        let Some(memory) = self.memory.as_deref() else {
            return self.config.clone();
        };
        let mut config = self.config.clone();
        config.memory_type = memory.memory_type();
        config.size = memory.size();
        config.capacity = memory.capacity();
        config.align = memory.align();
        config.memory_flag = memory.memory_flag();
        if let Some(surface) = memory.surface_buffer() {
            *config.surface_buffer_config = surface.config().clone();
        }
        config
    }

    /// Clear attributes, metadata and the memory's size.
    pub fn reset(&mut self) {
        self.pts = 0;
        self.dts = 0;
        self.duration = 0;
        self.flag = BufferFlags::empty();
        self.meta.clear();
        if let Some(memory) = self.memory.as_deref_mut() {
            memory.reset();
        }
    }

    /// Write attributes, metadata and the memory handle.
    ///
    /// Fails for virtual and secure hardware memory; on failure the parcel
    /// is left as it was.
    pub fn write_to_parcel(&self, parcel: &mut MessageParcel) -> Result<()> {
        if let Some(memory) = self.memory.as_deref() {
            if !memory.memory_type().supports_ipc() {
                return Err(Error::InvalidOperation(format!(
                    "{} memory cannot be transmitted",
                    memory.memory_type()
                )));
            }
        }

        let mark = parcel.mark();
        let result = self.write_fields(parcel);
        if result.is_err() {
            parcel.rollback(mark);
        }
        result
    }

    fn write_fields(&self, parcel: &mut MessageParcel) -> Result<()> {
        parcel.write_u64(self.unique_id());
        parcel.write_i64(self.pts);
        parcel.write_i64(self.dts);
        parcel.write_i64(self.duration);
        parcel.write_u32(self.flag.bits());
        self.meta.write_to_parcel(parcel)?;
        parcel.write_bool(self.memory.is_none());
        match self.memory.as_deref() {
            Some(memory) => memory.write_to_parcel(parcel),
            None => Ok(()),
        }
    }

    /// Replace this buffer's state with one read from `parcel`.
    ///
    /// With `is_surface_buffer`, the parcel holds a bare surface-buffer
    /// marshal and only the memory is replaced. Otherwise, if the incoming
    /// id equals this buffer's and the memory has the same type, capacity,
    /// alignment and offset, the handle payload is skipped and only
    /// attributes and the memory's size are refreshed.
    ///
    /// On error this buffer is unchanged.
    pub fn read_from_parcel(&mut self, parcel: &mut MessageParcel, is_surface_buffer: bool) -> Result<()> {
        if is_surface_buffer {
            let memory = SurfaceMemory::from_surface_parcel(parcel)?;
            self.config = config_from_memory(&memory);
            self.memory = Some(Box::new(memory));
            return Ok(());
        }

        let uid = parcel.read_u64()?;
        let pts = parcel.read_i64()?;
        let dts = parcel.read_i64()?;
        let duration = parcel.read_i64()?;
        let flag = BufferFlags::from_bits_retain(parcel.read_u32()?);
        let meta = Meta::read_from_parcel(parcel)?;
        let attributes_only = parcel.read_bool()?;

        let memory = if attributes_only {
            None
        } else {
            let memory_type = MemoryType::from_tag(parcel.read_u8()?);
            let core = MemoryCore::read_from_parcel(parcel)?;
            // The live mapping only covers its own layout, so any other
            // layout goes through a full rebuild and its length checks.
            let same_storage = self.uid.get() == Some(&uid)
                && self.memory.as_deref().is_some_and(|m| {
                    m.memory_type() == memory_type
                        && m.capacity() == core.capacity
                        && m.offset() == core.offset
                        && m.align() == core.align
                });

            if same_storage {
                skip_payload(memory_type, parcel)?;
                if let Some(current) = self.memory.as_deref_mut() {
                    current.set_size(core.size as i64);
                }
                tracing::debug!(uid, "refreshed buffer attributes");
                self.memory.take()
            } else {
                Some(memory_from_payload(memory_type, core, parcel)?)
            }
        };

        self.uid = if uid == 0 {
            OnceLock::new()
        } else {
            OnceLock::from(uid)
        };
        self.pts = pts;
        self.dts = dts;
        self.duration = duration;
        self.flag = flag;
        self.meta = meta;
        self.config = match memory.as_deref() {
            Some(memory) => config_from_memory(memory),
            None => BufferConfig::default(),
        };
        self.memory = memory;
        Ok(())
    }
}

/// A config describing `memory` as it is.
fn config_from_memory(memory: &dyn AvMemory) -> BufferConfig {
    let mut config = BufferConfig {
        size: memory.size(),
        align: memory.align(),
        memory_type: memory.memory_type(),
        memory_flag: memory.memory_flag(),
        capacity: memory.capacity(),
        ..Default::default()
    };
    if let Some(surface) = memory.surface_buffer() {
        *config.surface_buffer_config = surface.config().clone();
    }
    config
}

impl Default for AvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AvBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvBuffer")
            .field("uid", &self.uid.get())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("flag", &self.flag)
            .field("meta", &self.meta)
            .field("memory", &self.memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFlag;
    use crate::surface::{BufferRequestConfig, PixelFormat};

    #[test]
    fn test_empty_buffer() {
        let buffer = AvBuffer::new();
        assert!(buffer.is_attributes_only());
        assert!(buffer.memory().is_none());
        assert_eq!(buffer.config().memory_type, MemoryType::Unknown);
    }

    #[test]
    fn test_from_config_virtual() {
        let mut config = BufferConfig::virtual_memory(100);
        config.capacity = 200;
        let buffer = AvBuffer::from_config(&config).unwrap();
        let memory = buffer.memory().unwrap();
        assert_eq!(memory.capacity(), 200);
        assert_eq!(memory.memory_type(), MemoryType::Virtual);
        assert_eq!(buffer.config().capacity, 200);
    }

    #[test]
    fn test_from_config_unknown_type() {
        assert!(AvBuffer::from_config(&BufferConfig::default()).is_err());
    }

    #[test]
    fn test_from_config_hardware_requires_fd() {
        let mut config = BufferConfig::virtual_memory(64);
        config.memory_type = MemoryType::Hardware;
        assert!(matches!(
            AvBuffer::from_config(&config),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_from_config_surface_geometry() {
        let geometry = BufferRequestConfig::new(64, 32, PixelFormat::Bgra8888);
        let buffer = AvBuffer::from_config(&BufferConfig::surface_memory(geometry.clone())).unwrap();
        let config = buffer.config();
        assert_eq!(config.memory_type, MemoryType::Surface);
        assert_eq!(config.capacity, 64 * 4 * 32);
        assert!(config.surface_buffer_config.same_geometry(&geometry));
    }

    #[test]
    fn test_config_refreshes_size() {
        let mut buffer = AvBuffer::from_config(&BufferConfig::virtual_memory(16)).unwrap();
        buffer.memory_mut().unwrap().write(b"abc", None);
        assert_eq!(buffer.config().size, 3);
    }

    #[test]
    fn test_unique_id_stable_and_distinct() {
        let a = AvBuffer::new();
        let b = AvBuffer::new();
        assert_ne!(a.unique_id(), 0);
        assert_eq!(a.unique_id(), a.unique_id());
        assert_ne!(a.unique_id(), b.unique_id());
    }

    #[test]
    fn test_unique_id_layout() {
        let pid = u64::from(std::process::id() & 0xffff);
        let ids: Vec<u64> = (0..1024).map(|_| generate_unique_id()).collect();
        for id in &ids {
            assert_ne!(*id, 0);
            assert_eq!((id >> 16) & 0xffff, pid);
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }

    #[test]
    fn test_raw_parts_not_freed() {
        let mut backing = vec![1u8; 16];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let buffer = unsafe { AvBuffer::from_raw_parts(ptr, 16, 8) }.unwrap();
        assert_eq!(buffer.memory().unwrap().size(), 8);
        drop(buffer);
        assert_eq!(backing[0], 1);
        assert!(unsafe { AvBuffer::from_raw_parts(ptr, 16, 17) }.is_err());
    }

    #[test]
    fn test_attributes_only_roundtrip() {
        let mut buffer = AvBuffer::new();
        buffer.pts = 1_000;
        buffer.dts = 900;
        buffer.duration = 33;
        buffer.flag = BufferFlags::EOS | BufferFlags::from_bits_retain(1 << 20);
        buffer.meta_mut().set("track", 1);

        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        let received = AvBuffer::from_parcel(&mut parcel).unwrap();

        assert!(received.is_attributes_only());
        assert_eq!(received.unique_id(), buffer.unique_id());
        assert_eq!(received.pts, 1_000);
        assert_eq!(received.dts, 900);
        assert_eq!(received.duration, 33);
        assert_eq!(received.flag.bits(), buffer.flag.bits());
        assert_eq!(received.meta().get_i32("track"), Some(1));
    }

    #[test]
    fn test_virtual_buffer_write_fails_cleanly() {
        let buffer = AvBuffer::from_config(&BufferConfig::virtual_memory(64)).unwrap();
        let mut parcel = MessageParcel::new();
        parcel.write_u32(5);
        assert!(buffer.write_to_parcel(&mut parcel).is_err());
        assert_eq!(parcel.data_len(), 4);
    }

    #[test]
    fn test_shared_buffer_roundtrip() {
        let config = BufferConfig::shared_memory(256, MemoryFlag::READ_WRITE);
        let mut buffer = AvBuffer::from_config(&config).unwrap();
        buffer.memory_mut().unwrap().write(b"payload", None);

        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        let received = AvBuffer::from_parcel(&mut parcel).unwrap();

        let memory = received.memory().unwrap();
        assert_eq!(memory.memory_type(), MemoryType::Shared);
        assert_eq!(memory.as_slice().unwrap(), b"payload");
        assert_eq!(received.config().capacity, 256);
    }

    #[test]
    fn test_same_uid_refreshes_without_remap() {
        let config = BufferConfig::shared_memory(128, MemoryFlag::READ_WRITE);
        let mut buffer = AvBuffer::from_config(&config).unwrap();
        buffer.memory_mut().unwrap().write(b"first", None);

        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        let mut received = AvBuffer::from_parcel(&mut parcel).unwrap();
        let addr = received.memory().unwrap().addr();

        buffer.memory_mut().unwrap().write(b"second!", Some(0));
        buffer.pts = 42;
        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        received.read_from_parcel(&mut parcel, false).unwrap();

        assert_eq!(received.pts, 42);
        assert_eq!(received.memory().unwrap().addr(), addr);
        assert_eq!(received.memory().unwrap().as_slice().unwrap(), b"second!");
    }

    #[test]
    fn test_same_uid_with_other_layout_is_rebuilt() {
        let config = BufferConfig::shared_memory(4096, MemoryFlag::READ_WRITE);
        let mut buffer = AvBuffer::from_config(&config).unwrap();
        let addr = buffer.memory().unwrap().addr();

        // Same uid and capacity, but an offset far past the 4 KiB descriptor.
        let mut parcel = MessageParcel::new();
        parcel.write_u64(buffer.unique_id());
        parcel.write_i64(1);
        parcel.write_i64(1);
        parcel.write_i64(1);
        parcel.write_u32(0);
        Meta::new().write_to_parcel(&mut parcel).unwrap();
        parcel.write_bool(false);
        parcel.write_u8(MemoryType::Shared.tag());
        parcel.write_string("moved");
        parcel.write_i32(4096);
        parcel.write_i32(1 << 20);
        parcel.write_i32(4096 + (1 << 20));
        parcel.write_i32(0);
        parcel
            .write_file_descriptor(buffer.memory().unwrap().file_descriptor().unwrap())
            .unwrap();
        parcel.write_u32(MemoryFlag::READ_WRITE.bits());

        assert!(buffer.read_from_parcel(&mut parcel, false).is_err());
        assert_eq!(buffer.pts, 0);
        let memory = buffer.memory().unwrap();
        assert_eq!(memory.offset(), 0);
        assert_eq!(memory.addr(), addr);
    }

    #[test]
    fn test_same_uid_with_same_layout_updates_size_only() {
        let config = BufferConfig::shared_memory(64, MemoryFlag::READ_WRITE);
        let mut buffer = AvBuffer::from_config(&config).unwrap();
        buffer.memory_mut().unwrap().write(b"abcdef", None);

        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        buffer.memory_mut().unwrap().set_size(2);
        parcel.rewind();
        buffer.read_from_parcel(&mut parcel, false).unwrap();

        let memory = buffer.memory().unwrap();
        assert_eq!(memory.size(), 6);
        assert_eq!(memory.offset(), 0);
        assert_eq!(memory.as_slice().unwrap(), b"abcdef");
    }

    #[test]
    fn test_surface_parcel_fast_path() {
        let surface =
            SurfaceBuffer::alloc(&BufferRequestConfig::new(8, 8, PixelFormat::Rgba8888)).unwrap();
        let mut parcel = MessageParcel::new();
        surface.write_to_parcel(&mut parcel).unwrap();

        let mut buffer = AvBuffer::new();
        buffer.read_from_parcel(&mut parcel, true).unwrap();
        let memory = buffer.memory().unwrap();
        assert_eq!(memory.memory_type(), MemoryType::Surface);
        assert_eq!(memory.capacity(), surface.size());
        assert_eq!(memory.surface_buffer().unwrap().seq_num(), surface.seq_num());
    }

    #[test]
    fn test_malformed_parcel_leaves_buffer_unchanged() {
        let mut buffer = AvBuffer::new();
        buffer.pts = 7;
        let mut parcel = MessageParcel::new();
        parcel.write_u64(1);
        parcel.write_i64(99);
        assert!(buffer.read_from_parcel(&mut parcel, false).is_err());
        assert_eq!(buffer.pts, 7);
    }

    #[test]
    fn test_reset_clears_attributes() {
        let mut buffer = AvBuffer::from_config(&BufferConfig::virtual_memory(8)).unwrap();
        buffer.pts = 5;
        buffer.flag = BufferFlags::SYNC_FRAME;
        buffer.meta_mut().set("k", true);
        buffer.memory_mut().unwrap().write(b"1234", None);
        buffer.reset();
        assert_eq!(buffer.pts, 0);
        assert!(buffer.flag.is_empty());
        assert!(buffer.meta().is_empty());
        assert_eq!(buffer.memory().unwrap().size(), 0);
    }
}

//! # avbuffer
//!
//! Reference-counted media buffers over four memory backends, with
//! zero-copy transfer of buffer handles between processes.
//!
//! A buffer's bytes never travel: crossing a process boundary sends the
//! *capability* to reach them (a duplicated file descriptor plus its
//! bookkeeping), and the receiver maps the same physical pages.
//!
//! ## Features
//!
//! - **Four backends**: heap, memfd shared memory, graphics surfaces and
//!   DMA-heap buffers behind one [`AvMemory`](memory::AvMemory) contract
//! - **Bounds-safe I/O**: reads and writes truncate at capacity and size
//! - **fd passing**: [`MessageParcel`](parcel::MessageParcel) over Unix
//!   sockets with `SCM_RIGHTS`
//! - **Access rights**: read-only shared memory is mapped read-only remotely
//! - **rkyv metadata**: per-buffer key-value [`Meta`](metadata::Meta)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use avbuffer::prelude::*;
//! use std::os::unix::net::UnixStream;
//!
//! let (tx, rx) = UnixStream::pair()?;
//!
//! // Producer
//! let config = BufferConfig::shared_memory(1 << 20, MemoryFlag::READ_WRITE);
//! let mut buffer = AvBuffer::from_config(&config)?;
//! buffer.memory_mut().unwrap().write(&frame, None);
//! let mut parcel = MessageParcel::new();
//! buffer.write_to_parcel(&mut parcel)?;
//! parcel.send(&tx)?;
//!
//! // Consumer
//! let mut parcel = MessageParcel::recv(&rx)?;
//! let received = AvBuffer::from_parcel(&mut parcel)?;
//! let bytes = received.memory().unwrap().as_slice();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod parcel;
pub mod surface;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{AvBuffer, BufferFlags};
    pub use crate::config::BufferConfig;
    pub use crate::error::{Error, Result};
    pub use crate::memory::buffer_pool::BufferRecycler;
    pub use crate::memory::{
        AllocatorFactory, AnyAllocator, AvMemory, MemoryFlag, MemoryType, create_memory,
        read_memory_from_parcel,
    };
    pub use crate::metadata::{Meta, MetaValue};
    pub use crate::parcel::MessageParcel;
    pub use crate::surface::{BufferRequestConfig, PixelFormat, SurfaceBuffer};
}

pub use error::{Error, Result};

//! Descriptor accounting across buffer lifecycles.
//!
//! Counts entries in `/proc/self/fd`, so this file holds a single test: each
//! integration test binary is its own process and nothing else opens
//! descriptors while it runs.

use avbuffer::prelude::*;
use rustix::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;

fn memfd(len: u64) -> OwnedFd {
    let fd = rustix::fs::memfd_create("test_dma", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
    rustix::fs::ftruncate(&fd, len).unwrap();
    fd
}

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn test_buffers_release_every_descriptor() {
    let dma = memfd(4096);
    let (tx, rx) = UnixStream::pair().unwrap();
    let baseline = open_fds();

    for _ in 0..4 {
        // Secure hardware memory owns one duplicate until it is dropped.
        let allocator = AllocatorFactory::create_hardware_allocator(
            dma.as_fd(),
            4096,
            MemoryFlag::READ_WRITE,
            true,
        )
        .unwrap();
        let buffer = AvBuffer::from_allocator(&allocator, 0, 0).unwrap();
        assert!(buffer.memory().unwrap().addr().is_none());
        let mut parcel = MessageParcel::new();
        assert!(buffer.write_to_parcel(&mut parcel).is_err());
        drop(parcel);
        assert_eq!(open_fds(), baseline + 1);
        drop(buffer);
        drop(allocator);
        assert_eq!(open_fds(), baseline);

        // Mapped hardware memory shared by two buffers.
        let allocator = AllocatorFactory::create_hardware_allocator(
            dma.as_fd(),
            4096,
            MemoryFlag::READ_WRITE,
            false,
        )
        .unwrap();
        let first = AvBuffer::from_allocator(&allocator, 0, 0).unwrap();
        let second = AvBuffer::from_allocator(&allocator, 0, 0).unwrap();
        drop(allocator);
        drop(first);
        drop(second);
        assert_eq!(open_fds(), baseline);

        // Shared memory sent across a socket and reconstructed.
        let config = BufferConfig::shared_memory(8192, MemoryFlag::READ_WRITE);
        let mut buffer = AvBuffer::from_config(&config).unwrap();
        buffer.memory_mut().unwrap().write(b"counted", None);
        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        parcel.send(&tx).unwrap();
        drop(parcel);
        let mut parcel = MessageParcel::recv(&rx).unwrap();
        let received = AvBuffer::from_parcel(&mut parcel).unwrap();
        drop(parcel);
        assert_eq!(received.memory().unwrap().as_slice().unwrap(), b"counted");
        drop(received);
        drop(buffer);
        assert_eq!(open_fds(), baseline);

        // A rejected parcel releases the descriptors it carried.
        let buffer = AvBuffer::from_config(&config).unwrap();
        let mut parcel = MessageParcel::new();
        buffer.write_to_parcel(&mut parcel).unwrap();
        let truncated = parcel.data()[..parcel.data_len() - 1].to_vec();
        drop(parcel);
        let mut parcel = MessageParcel::from_parts(truncated, vec![memfd(8192)]);
        assert!(AvBuffer::from_parcel(&mut parcel).is_err());
        drop(parcel);
        drop(buffer);
        assert_eq!(open_fds(), baseline);
    }
}

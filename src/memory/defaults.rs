//! Default sizes and configuration constants.
//!
//! These values bound what the parcel reader accepts and name the kernel
//! objects this crate creates.

/// Prefix for memfd names and generated memory names (visible in `/proc/self/fd/`).
pub const NAME_PREFIX: &str = "avbuffer";

/// Page size assumed when the kernel cannot be asked.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Longest string accepted from a parcel (memory names, metadata keys).
pub const MAX_PARCEL_STRING_LEN: usize = 4096;

/// Largest byte blob accepted from a parcel (serialized metadata).
pub const MAX_PARCEL_BLOB_LEN: usize = 16 * 1024 * 1024;

/// Largest parcel payload accepted from a socket.
pub const MAX_PARCEL_DATA_LEN: usize = 64 * 1024 * 1024;

/// Most file descriptors accepted in one parcel.
pub const MAX_PARCEL_FDS: usize = 64;

/// File descriptors sent per `SCM_RIGHTS` control message.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

/// Default surface dequeue timeout in milliseconds.
pub const SURFACE_TIMEOUT_MS: i32 = 1000;

/// Default stride alignment for surface allocations.
pub const SURFACE_STRIDE_ALIGNMENT: u32 = 8;

/// Default number of idle buffers a recycler keeps.
pub const RECYCLER_MAX_IDLE: usize = 8;

/// Current page size.
pub fn page_size() -> usize {
    match rustix::param::page_size() {
        0 => FALLBACK_PAGE_SIZE,
        size => size,
    }
}

/// Round `value` up to a multiple of `align` (a power of two, or 0 for none).
pub const fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}

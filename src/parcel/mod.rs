//! Message parcels: a byte stream plus an out-of-band descriptor table.
//!
//! A [`MessageParcel`] is what crosses the process boundary. Scalars are
//! little-endian; strings and byte blobs carry a `u32` length prefix; file
//! descriptors are stored in a side table and referenced from the stream by
//! index. Over a Unix socket the table travels as `SCM_RIGHTS` (see
//! [`ipc`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use avbuffer::parcel::MessageParcel;
//! use std::os::unix::net::UnixStream;
//!
//! let (tx, rx) = UnixStream::pair()?;
//! let mut parcel = MessageParcel::new();
//! parcel.write_string("frame");
//! parcel.write_file_descriptor(&memfd)?;
//! parcel.send(&tx)?;
//!
//! let mut received = MessageParcel::recv(&rx)?;
//! assert_eq!(received.read_string()?, "frame");
//! let fd = received.read_file_descriptor()?;
//! ```

pub mod ipc;

use crate::error::{Error, Result};
use crate::memory::defaults;
use rustix::fd::{AsFd, AsRawFd, OwnedFd};
use std::fmt;

/// Serialized message with attached file descriptors.
#[derive(Default)]
pub struct MessageParcel {
    data: Vec<u8>,
    read_pos: usize,
    fds: Vec<OwnedFd>,
}

/// Write position saved by [`MessageParcel::mark`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParcelMark {
    data_len: usize,
    fd_count: usize,
}

fn dup_cloexec(fd: impl AsFd) -> Result<OwnedFd> {
    Ok(rustix::io::fcntl_dupfd_cloexec(fd, 0)?)
}

impl MessageParcel {
    /// An empty parcel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a parcel from received bytes and descriptors.
    pub fn from_parts(data: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        Self {
            data,
            read_pos: 0,
            fds,
        }
    }

    /// Bytes written so far.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// The serialized bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Current read offset into the byte stream.
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Descriptors attached to this parcel.
    #[inline]
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Restart reading from the beginning.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    pub(crate) fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Remember the current write end, to undo a failed composite write.
    pub(crate) fn mark(&self) -> ParcelMark {
        ParcelMark {
            data_len: self.data.len(),
            fd_count: self.fds.len(),
        }
    }

    /// Drop everything written after `mark`.
    pub(crate) fn rollback(&mut self, mark: ParcelMark) {
        self.data.truncate(mark.data_len);
        self.fds.truncate(mark.fd_count);
        self.read_pos = self.read_pos.min(mark.data_len);
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Append a byte.
    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Append a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.data.push(u8::from(value));
    }

    /// Append a signed 32-bit integer.
    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append an unsigned 32-bit integer.
    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a signed 64-bit integer.
    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append an unsigned 64-bit integer.
    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Append a length-prefixed byte blob.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.data.extend_from_slice(value);
    }

    /// Attach a duplicate of `fd` and append its table index.
    pub fn write_file_descriptor(&mut self, fd: impl AsFd) -> Result<()> {
        let dup = dup_cloexec(fd)?;
        let index = self.fds.len() as u32;
        self.fds.push(dup);
        self.write_u32(index);
        Ok(())
    }

    /// Overwrite eight bytes at `at` with `value`.
    pub fn patch_u64(&mut self, at: usize, value: u64) -> Result<()> {
        let slot = at
            .checked_add(8)
            .and_then(|end| self.data.get_mut(at..end))
            .ok_or_else(|| Error::InvalidParameter(format!("patch offset {at} out of range")))?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            return Err(Error::InvalidData(format!(
                "parcel underflow: need {len} bytes at {}, {} left",
                self.read_pos,
                self.remaining()
            )));
        }
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.data[start..start + len])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read a boolean; any byte other than 0 or 1 is rejected.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::InvalidData(format!("invalid bool byte {other}"))),
        }
    }

    /// Read a signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.take_array().map(i32::from_le_bytes)
    }

    /// Read an unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    /// Read a signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.take_array().map(i64::from_le_bytes)
    }

    /// Read an unsigned 64-bit integer.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > defaults::MAX_PARCEL_STRING_LEN {
            return Err(Error::InvalidData(format!("string length {len} too large")));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::InvalidData(format!("string is not UTF-8: {e}")))
    }

    /// Read a length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > defaults::MAX_PARCEL_BLOB_LEN {
            return Err(Error::InvalidData(format!("blob length {len} too large")));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Read a descriptor index and return a fresh duplicate of that entry.
    pub fn read_file_descriptor(&mut self) -> Result<OwnedFd> {
        let index = self.read_u32()? as usize;
        let fd = self.fds.get(index).ok_or_else(|| {
            Error::InvalidData(format!(
                "fd index {index} out of range ({} attached)",
                self.fds.len()
            ))
        })?;
        dup_cloexec(fd)
    }

    /// Consume a descriptor index without duplicating it.
    pub fn skip_file_descriptor(&mut self) -> Result<()> {
        let index = self.read_u32()? as usize;
        if index >= self.fds.len() {
            return Err(Error::InvalidData(format!("fd index {index} out of range")));
        }
        Ok(())
    }

    /// Advance the read position by `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }
}

impl fmt::Debug for MessageParcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fds: Vec<_> = self.fds.iter().map(AsRawFd::as_raw_fd).collect();
        f.debug_struct("MessageParcel")
            .field("len", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("fds", &fds)
            .finish()
    }
}

//! Moving parcels between processes over Unix domain sockets.
//!
//! File descriptors travel as `SCM_RIGHTS` ancillary messages. A parcel is
//! sent as a fixed header (`data_len: u32`, `fd_count: u32`) carrying the
//! first batch of descriptors, further batches on one-byte messages if the
//! parcel has more than [`MAX_FDS_PER_MESSAGE`], then the payload bytes.

use super::MessageParcel;
use crate::error::{Error, Result};
use crate::memory::defaults::{self, MAX_FDS_PER_MESSAGE};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

const HEADER_LEN: usize = 8;

/// Send file descriptors over a Unix socket.
///
/// # Arguments
///
/// * `socket` - The Unix socket to send over.
/// * `fds` - Descriptors to send, at most [`MAX_FDS_PER_MESSAGE`].
/// * `data` - Data payload sent along with the fds.
///
/// # Example
///
/// ```rust,ignore
/// use std::os::unix::net::UnixStream;
/// use avbuffer::parcel::ipc::send_fds;
///
/// let (sender, receiver) = UnixStream::pair()?;
/// send_fds(&sender, &[memfd.as_fd()], b"hello")?;
/// ```
pub fn send_fds<Fd: AsFd>(socket: &UnixStream, fds: &[Fd], data: &[u8]) -> Result<()> {
    if fds.is_empty() {
        return Err(Error::InvalidParameter("no file descriptors to send".into()));
    }
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(Error::InvalidParameter(format!(
            "too many fds: {} > {}",
            fds.len(),
            MAX_FDS_PER_MESSAGE
        )));
    }

    // SCM_RIGHTS needs at least one byte of data
    let data = if data.is_empty() { &[0u8] } else { data };

    let borrowed_fds: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed_fds)) {
        return Err(Error::InvalidOperation(
            "failed to add fds to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    let sent = sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    if sent != data.len() {
        // The descriptors went out with the first byte; push the rest.
        (&*socket).write_all(&data[sent..])?;
    }
    Ok(())
}

/// Receive file descriptors from a Unix socket.
///
/// Returns the number of data bytes read and the received descriptors.
pub fn recv_fds(socket: &UnixStream, data_buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    if data_buf.is_empty() {
        return Err(Error::InvalidParameter("data buffer cannot be empty".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(data_buf)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)?;

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    if result.flags.contains(ReturnFlags::CTRUNC) {
        return Err(Error::InvalidData("ancillary data truncated".into()));
    }
    Ok((result.bytes, fds))
}

impl MessageParcel {
    /// Send this parcel, including its descriptors, over `socket`.
    pub fn send(&self, socket: &UnixStream) -> Result<()> {
        let data_len = u32::try_from(self.data_len())
            .ok()
            .filter(|&len| len as usize <= defaults::MAX_PARCEL_DATA_LEN)
            .ok_or_else(|| Error::InvalidOperation(format!("parcel of {} bytes", self.data_len())))?;
        if self.fd_count() > defaults::MAX_PARCEL_FDS {
            return Err(Error::InvalidOperation(format!(
                "parcel carries {} fds",
                self.fd_count()
            )));
        }

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&data_len.to_le_bytes());
        header[4..].copy_from_slice(&(self.fd_count() as u32).to_le_bytes());

        let mut batches = self.fds().chunks(MAX_FDS_PER_MESSAGE);
        match batches.next() {
            Some(first) => send_fds(socket, first, &header)?,
            None => (&*socket).write_all(&header)?,
        }
        for batch in batches {
            send_fds(socket, batch, &[0u8])?;
        }

        (&*socket).write_all(self.data())?;
        tracing::debug!(
            len = self.data_len(),
            fds = self.fd_count(),
            "sent parcel"
        );
        Ok(())
    }

    /// Receive one parcel sent with [`send`](Self::send).
    pub fn recv(socket: &UnixStream) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        let (read, mut fds) = recv_fds(socket, &mut header)?;
        if read == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if read < HEADER_LEN {
            (&*socket).read_exact(&mut header[read..])?;
        }

        let data_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let fd_count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if data_len > defaults::MAX_PARCEL_DATA_LEN || fd_count > defaults::MAX_PARCEL_FDS {
            return Err(Error::InvalidData(format!(
                "parcel header out of range: {data_len} bytes, {fd_count} fds"
            )));
        }

        while fds.len() < fd_count {
            let mut marker = [0u8; 1];
            let (read, batch) = recv_fds(socket, &mut marker)?;
            if read == 0 || batch.is_empty() {
                return Err(Error::InvalidData(format!(
                    "expected {fd_count} fds, received {}",
                    fds.len()
                )));
            }
            fds.extend(batch);
        }
        if fds.len() != fd_count {
            return Err(Error::InvalidData(format!(
                "expected {fd_count} fds, received {}",
                fds.len()
            )));
        }

        let mut data = vec![0u8; data_len];
        (&*socket).read_exact(&mut data)?;
        tracing::debug!(len = data_len, fds = fd_count, "received parcel");
        Ok(MessageParcel::from_parts(data, fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsRawFd;

    fn memfd(len: u64) -> OwnedFd {
        let fd = rustix::fs::memfd_create("test_ipc", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, len).unwrap();
        fd
    }

    #[test]
    fn test_send_recv_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let fd = memfd(4096);

        send_fds(&sender, &[fd.as_fd()], b"hello").unwrap();

        let mut buf = [0u8; 16];
        let (len, fds) = recv_fds(&receiver, &mut buf).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fds.len(), 1);
        assert_eq!(rustix::fs::fstat(&fds[0]).unwrap().st_size, 4096);
    }

    #[test]
    fn test_send_empty_fds_fails() {
        let (sender, _receiver) = UnixStream::pair().unwrap();
        let empty: &[BorrowedFd<'_>] = &[];
        assert!(send_fds(&sender, empty, b"data").is_err());
    }

    #[test]
    fn test_parcel_over_socket() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let fd = memfd(128);

        let mut parcel = MessageParcel::new();
        parcel.write_string("over the wire");
        parcel.write_file_descriptor(&fd).unwrap();
        parcel.write_i64(-1);
        parcel.send(&sender).unwrap();

        let mut received = MessageParcel::recv(&receiver).unwrap();
        assert_eq!(received.read_string().unwrap(), "over the wire");
        let received_fd = received.read_file_descriptor().unwrap();
        assert_ne!(received_fd.as_raw_fd(), fd.as_raw_fd());
        assert_eq!(rustix::fs::fstat(&received_fd).unwrap().st_size, 128);
        assert_eq!(received.read_i64().unwrap(), -1);
    }

    #[test]
    fn test_parcel_without_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let mut parcel = MessageParcel::new();
        parcel.write_u32(17);
        parcel.send(&sender).unwrap();

        let mut received = MessageParcel::recv(&receiver).unwrap();
        assert_eq!(received.fd_count(), 0);
        assert_eq!(received.read_u32().unwrap(), 17);
    }

    #[test]
    fn test_parcel_with_many_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let fds: Vec<OwnedFd> = (1..=10).map(|i| memfd(i * 64)).collect();

        let mut parcel = MessageParcel::new();
        for fd in &fds {
            parcel.write_file_descriptor(fd).unwrap();
        }
        parcel.send(&sender).unwrap();

        let mut received = MessageParcel::recv(&receiver).unwrap();
        assert_eq!(received.fd_count(), 10);
        for i in 1..=10u64 {
            let fd = received.read_file_descriptor().unwrap();
            assert_eq!(rustix::fs::fstat(&fd).unwrap().st_size as u64, i * 64);
        }
    }

    #[test]
    fn test_recv_on_closed_socket() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);
        assert!(MessageParcel::recv(&receiver).is_err());
    }
}

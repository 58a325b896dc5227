// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Framed message transport between the two proxy processes.
//!
//! Frames are a `u32` little-endian length prefix followed by the encoded
//! message. Reads are resumable across partial input; writes finish a whole
//! frame before returning so message boundaries never interleave.

use std::os::unix::net::UnixStream;
use std::os::unix::prelude::{AsRawFd, OwnedFd, RawFd};

use log::warn;
use nix::errno::Errno;

use crate::file_util;
use crate::protocol::{VsockMessage, MAX_MESSAGE_SIZE};
use crate::vsock_proxy::{Error, Result};

const LENGTH_PREFIX_SIZE: usize = 4;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Framed, ordered delivery of [`VsockMessage`]s with optional ancillary fds.
///
/// The stream never interprets received fds; it hands them to the caller
/// attached to the message whose bytes they arrived with.
pub struct MessageStream {
    transport: UnixStream,
    /// Bytes received but not yet consumed as a complete frame.
    read_buf: Vec<u8>,
    /// Fds received while buffering the current frame.
    pending_fds: Vec<OwnedFd>,
}

impl MessageStream {
    pub fn new(transport: UnixStream) -> Result<Self> {
        transport
            .set_nonblocking(true)
            .map_err(Error::TransportError)?;
        Ok(MessageStream {
            transport,
            read_buf: Vec::new(),
            pending_fds: Vec::new(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }

    /// Reads one message plus any fds that arrived with it.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet; the caller
    /// comes back on the next readability notification. EOF is
    /// [`Error::TransportClosed`], decode failures are
    /// [`Error::MalformedMessage`].
    pub fn read_message(&mut self) -> Result<Option<(VsockMessage, Vec<OwnedFd>)>> {
        loop {
            if let Some(payload_len) = self.buffered_frame_len()? {
                if self.read_buf.len() >= LENGTH_PREFIX_SIZE + payload_len {
                    let payload: Vec<u8> = self
                        .read_buf
                        .drain(..LENGTH_PREFIX_SIZE + payload_len)
                        .skip(LENGTH_PREFIX_SIZE)
                        .collect();
                    let message = VsockMessage::decode(&payload)?;
                    let fds = std::mem::take(&mut self.pending_fds);
                    return Ok(Some((message, fds)));
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match file_util::recv_with_fds(self.transport.as_raw_fd(), &mut chunk) {
                Ok((0, _)) => return Err(Error::TransportClosed),
                Ok((n, fds)) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.pending_fds.extend(fds);
                }
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::TransportError(e.into())),
            }
        }
    }

    fn buffered_frame_len(&self) -> Result<Option<usize>> {
        if self.read_buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.read_buf[..LENGTH_PREFIX_SIZE].try_into().unwrap());
        let len = len as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::MalformedMessage("frame length over limit"));
        }
        Ok(Some(len))
    }

    /// Writes one message and its attached fds as a single frame.
    ///
    /// All-or-nothing from the caller's point of view: on a short write the
    /// stream polls the transport writable and resumes until the frame is
    /// complete. The fds are attached to the first chunk the kernel accepts.
    pub fn write_message(&mut self, message: &VsockMessage, fds: &[RawFd]) -> Result<()> {
        let payload = message.encode();
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut offset = 0;
        let mut fds_sent = false;
        while offset < frame.len() {
            let attached: &[RawFd] = if fds_sent { &[] } else { fds };
            match file_util::send_with_fds(self.transport.as_raw_fd(), &frame[offset..], attached) {
                Ok(n) => {
                    offset += n;
                    fds_sent = true;
                }
                Err(Errno::EAGAIN) => {
                    if let Err(e) = file_util::wait_writable(self.transport.as_raw_fd()) {
                        return Err(Error::TransportError(e));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    warn!("proxy: transport closed while writing a message");
                    return Err(Error::TransportClosed);
                }
                Err(e) => return Err(Error::TransportError(e.into())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::file_util::{classify_fd, create_pipe};
    use crate::protocol::{FdDescription, FdKind};

    fn stream_pair() -> (MessageStream, MessageStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (MessageStream::new(a).unwrap(), MessageStream::new(b).unwrap())
    }

    #[test]
    fn test_write_then_read() {
        let (mut a, mut b) = stream_pair();
        let message = VsockMessage::Data {
            handle: 1,
            blob: b"abcdefg\0".to_vec(),
            fds: vec![],
        };
        a.write_message(&message, &[]).unwrap();

        file_util::wait_readable(b.as_raw_fd()).unwrap();
        let (read, fds) = b.read_message().unwrap().unwrap();
        assert_eq!(read, message);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_buffer() {
        let (mut a, mut b) = stream_pair();
        for handle in 1..=3 {
            a.write_message(&VsockMessage::Close { handle }, &[]).unwrap();
        }
        file_util::wait_readable(b.as_raw_fd()).unwrap();
        for handle in 1..=3 {
            let (message, _) = b.read_message().unwrap().unwrap();
            assert_eq!(message, VsockMessage::Close { handle });
        }
        assert!(b.read_message().unwrap().is_none());
    }

    #[test]
    fn test_fds_attach_to_their_message() {
        let (mut a, mut b) = stream_pair();
        let (read_end, _write_end) = create_pipe().unwrap();
        let message = VsockMessage::Data {
            handle: 2,
            blob: b"with fd".to_vec(),
            fds: vec![FdDescription {
                kind: FdKind::Transportable,
                handle: 9,
                flags: 0,
            }],
        };
        a.write_message(&message, &[read_end.as_raw_fd()]).unwrap();

        file_util::wait_readable(b.as_raw_fd()).unwrap();
        let (read, fds) = b.read_message().unwrap().unwrap();
        assert_eq!(read, message);
        assert_eq!(fds.len(), 1);
        assert_eq!(classify_fd(&fds[0]).unwrap().0, FdKind::FifoRead);
    }

    #[test]
    fn test_eof_is_transport_closed() {
        let (a, mut b) = stream_pair();
        drop(a);
        file_util::wait_readable(b.as_raw_fd()).unwrap();
        assert_matches!(b.read_message(), Err(Error::TransportClosed));
    }

    #[test]
    fn test_oversized_frame_is_malformed() {
        let (a, mut b) = stream_pair();
        let bogus = u32::MAX.to_le_bytes();
        file_util::send_with_fds(a.as_raw_fd(), &bogus, &[]).unwrap();
        file_util::wait_readable(b.as_raw_fd()).unwrap();
        assert_matches!(b.read_message(), Err(Error::MalformedMessage(_)));
    }
}

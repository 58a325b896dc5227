// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Per-fd I/O adaptor.
//!
//! A [`LocalFile`] wraps one registered local fd. It knows how to pull
//! available bytes (plus ancillary fds for socket kinds) without blocking,
//! and how to push bytes with fds while retaining partial writes across
//! event-loop iterations.

use std::collections::VecDeque;
use std::os::unix::prelude::{AsRawFd, OwnedFd, RawFd};

use log::warn;
use nix::errno::Errno;

use crate::file_util;
use crate::protocol::{FdKind, MAX_MESSAGE_SIZE, MAX_TRANSFERRED_FDS};

/// Upper bound on bytes moved by one non-blocking read.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on one remote pread, leaving headroom for the response
/// header so the blob always fits in a single frame.
pub const MAX_PREAD_SIZE: usize = MAX_MESSAGE_SIZE - 64;

/// Outcome of a non-blocking read.
pub enum ReadResult {
    /// Bytes and any fds received alongside them.
    Data { blob: Vec<u8>, fds: Vec<OwnedFd> },
    /// The peer closed its end.
    Eof,
    /// Nothing available; come back on the next readability notification.
    WouldBlock,
}

/// Whether the write queue drained completely or still needs EPOLLOUT.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Done,
    Pending,
}

struct QueuedWrite {
    blob: Vec<u8>,
    offset: usize,
    fds: Vec<OwnedFd>,
}

pub struct LocalFile {
    fd: OwnedFd,
    kind: FdKind,
    queue: VecDeque<QueuedWrite>,
    broken: bool,
}

impl LocalFile {
    pub fn new(fd: OwnedFd, kind: FdKind) -> std::io::Result<Self> {
        file_util::set_nonblocking(fd.as_raw_fd())?;
        Ok(LocalFile {
            fd,
            kind,
            queue: VecDeque::new(),
            broken: false,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }

    /// Attempts a non-blocking read of up to [`MAX_CHUNK_SIZE`] bytes.
    /// Socket kinds also collect any SCM_RIGHTS fds sent with the data.
    pub fn read(&mut self) -> std::io::Result<ReadResult> {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        if self.kind.is_socket() {
            match file_util::recv_with_fds(self.fd.as_raw_fd(), &mut buf) {
                // Datagram sockets have no EOF; an empty read is a
                // zero-length datagram.
                Ok((0, fds)) if self.kind == FdKind::Dgram => Ok(ReadResult::Data {
                    blob: Vec::new(),
                    fds,
                }),
                Ok((0, _)) => Ok(ReadResult::Eof),
                Ok((n, fds)) => {
                    if fds.len() > MAX_TRANSFERRED_FDS {
                        // Refuse rather than split across Data messages.
                        return Err(std::io::Error::from_raw_os_error(libc::EMSGSIZE));
                    }
                    buf.truncate(n);
                    Ok(ReadResult::Data { blob: buf, fds })
                }
                Err(Errno::EAGAIN) => Ok(ReadResult::WouldBlock),
                Err(Errno::EINTR) => Ok(ReadResult::WouldBlock),
                Err(e) => Err(e.into()),
            }
        } else {
            // SAFETY: the fd is valid and buf is writable for its full length.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(ReadResult::WouldBlock),
                    _ => Err(err),
                };
            }
            if n == 0 {
                return Ok(ReadResult::Eof);
            }
            buf.truncate(n as usize);
            Ok(ReadResult::Data {
                blob: buf,
                fds: Vec::new(),
            })
        }
    }

    /// Appends `(blob, fds)` to the write queue and drains as far as the fd
    /// allows. The fds are passed with the blob for socket kinds and closed
    /// once sent; for non-socket kinds they cannot travel and are closed
    /// immediately.
    ///
    /// `Err` means the file is broken: the queue is dropped and all further
    /// writes fail.
    pub fn write(&mut self, blob: Vec<u8>, mut fds: Vec<OwnedFd>) -> std::io::Result<WriteStatus> {
        if self.broken {
            return Err(std::io::Error::from_raw_os_error(libc::EPIPE));
        }
        if !fds.is_empty() && !self.kind.is_socket() {
            warn!(
                "proxy: dropping {} fds targeted at a non-socket fd {}",
                fds.len(),
                self.fd.as_raw_fd()
            );
            fds.clear();
        }
        self.queue.push_back(QueuedWrite {
            blob,
            offset: 0,
            fds,
        });
        self.drain()
    }

    /// Continues draining after a writability notification.
    pub fn continue_write(&mut self) -> std::io::Result<WriteStatus> {
        if self.broken {
            return Err(std::io::Error::from_raw_os_error(libc::EPIPE));
        }
        self.drain()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.queue.is_empty()
    }

    fn drain(&mut self) -> std::io::Result<WriteStatus> {
        while let Some(front) = self.queue.front_mut() {
            let result = if self.kind.is_socket() {
                let raw_fds: Vec<RawFd> = front.fds.iter().map(|f| f.as_raw_fd()).collect();
                file_util::send_with_fds(self.fd.as_raw_fd(), &front.blob[front.offset..], &raw_fds)
                    .map_err(std::io::Error::from)
            } else {
                // SAFETY: the fd is valid and the slice lives for the call.
                let n = unsafe {
                    libc::write(
                        self.fd.as_raw_fd(),
                        front.blob[front.offset..].as_ptr() as *const libc::c_void,
                        front.blob.len() - front.offset,
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            };

            match result {
                Ok(n) => {
                    // The fds, if any, went out with this chunk; drop closes
                    // our copies.
                    front.fds.clear();
                    front.offset += n;
                    if front.offset >= front.blob.len() {
                        self.queue.pop_front();
                    }
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(WriteStatus::Pending),
                    Some(libc::EINTR) => continue,
                    _ => {
                        self.broken = true;
                        self.queue.clear();
                        return Err(err);
                    }
                },
            }
        }
        Ok(WriteStatus::Done)
    }
}

/// Blocking pread for the worker pool. Returns `(errno, bytes)`; errno 0 on
/// success. Short kernel reads are retried, so the blob covers the requested
/// range up to end of file; reads past it yield an empty blob.
pub fn pread(fd: RawFd, count: u64, offset: u64) -> (i32, Vec<u8>) {
    let count = count.min(MAX_PREAD_SIZE as u64) as usize;
    let mut buf = vec![0u8; count];
    let mut filled = 0;
    while filled < count {
        // SAFETY: the fd is a dup held alive by the caller, buf is writable
        // for count bytes.
        let n = unsafe {
            libc::pread(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                count - filled,
                (offset + filled as u64) as libc::off_t,
            )
        };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return (errno, Vec::new());
        }
        if n == 0 {
            break;
        }
        filled += n as usize;
    }
    buf.truncate(filled);
    (0, buf)
}

/// Blocking pwrite for the worker pool. Returns `(errno, bytes_written)`.
pub fn pwrite(fd: RawFd, blob: &[u8], offset: u64) -> (i32, i64) {
    // SAFETY: the fd is a dup held alive by the caller, blob outlives the call.
    let n = unsafe {
        libc::pwrite(
            fd,
            blob.as_ptr() as *const libc::c_void,
            blob.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return (last_errno(), 0);
    }
    (0, n as i64)
}

/// Blocking fstat for the worker pool. Returns `(errno, size)`.
pub fn fstat_size(fd: RawFd) -> (i32, i64) {
    // SAFETY: the fd is a dup held alive by the caller and st is a properly
    // sized stat buffer.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut st) };
    if ret < 0 {
        return (last_errno(), 0);
    }
    (0, st.st_size as i64)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::*;
    use crate::file_util::{self, create_pipe, create_socket_pair};

    #[test]
    fn test_read_stream_data() {
        let (a, b) = create_socket_pair(FdKind::Stream).unwrap();
        let mut file = LocalFile::new(a, FdKind::Stream).unwrap();

        file_util::send_with_fds(b.as_raw_fd(), b"abcdefg\0", &[]).unwrap();
        match file.read().unwrap() {
            ReadResult::Data { blob, fds } => {
                assert_eq!(blob, b"abcdefg\0");
                assert!(fds.is_empty());
            }
            _ => panic!("expected data"),
        }

        // Nothing more queued.
        assert!(matches!(file.read().unwrap(), ReadResult::WouldBlock));

        drop(b);
        assert!(matches!(file.read().unwrap(), ReadResult::Eof));
    }

    #[test]
    fn test_read_collects_ancillary_fds() {
        let (a, b) = create_socket_pair(FdKind::Stream).unwrap();
        let mut file = LocalFile::new(a, FdKind::Stream).unwrap();

        let (pipe_r, _pipe_w) = create_pipe().unwrap();
        file_util::send_with_fds(b.as_raw_fd(), b"testdata\0", &[pipe_r.as_raw_fd()]).unwrap();
        match file.read().unwrap() {
            ReadResult::Data { blob, fds } => {
                assert_eq!(blob, b"testdata\0");
                assert_eq!(fds.len(), 1);
            }
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn test_zero_length_datagram_is_not_eof() {
        let (a, b) = create_socket_pair(FdKind::Dgram).unwrap();
        let mut file = LocalFile::new(a, FdKind::Dgram).unwrap();

        file_util::send_with_fds(b.as_raw_fd(), b"", &[]).unwrap();
        match file.read().unwrap() {
            ReadResult::Data { blob, fds } => {
                assert!(blob.is_empty());
                assert!(fds.is_empty());
            }
            _ => panic!("expected an empty datagram"),
        }

        // The channel keeps working afterwards.
        file_util::send_with_fds(b.as_raw_fd(), b"next", &[]).unwrap();
        match file.read().unwrap() {
            ReadResult::Data { blob, .. } => assert_eq!(blob, b"next"),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn test_write_queue_retains_partial_writes() {
        let (a, b) = create_socket_pair(FdKind::Stream).unwrap();
        let mut file = LocalFile::new(a, FdKind::Stream).unwrap();

        // Flood until the kernel buffer pushes back.
        let chunk = vec![0x5au8; MAX_CHUNK_SIZE];
        let mut queued = false;
        for _ in 0..1024 {
            if file.write(chunk.clone(), Vec::new()).unwrap() == WriteStatus::Pending {
                queued = true;
                break;
            }
        }
        assert!(queued, "socket buffer never filled");
        assert!(file.has_pending_writes());

        // Drain the peer, then the retained tail goes out.
        let mut sink = std::fs::File::from(b);
        let mut drain_buf = vec![0u8; MAX_CHUNK_SIZE];
        while file.has_pending_writes() {
            let _ = sink.read(&mut drain_buf).unwrap();
            if file.continue_write().unwrap() == WriteStatus::Done {
                break;
            }
        }
        assert!(!file.has_pending_writes());
    }

    #[test]
    fn test_write_to_read_only_end_marks_broken() {
        let (pipe_r, pipe_w) = create_pipe().unwrap();
        drop(pipe_w);
        let mut file = LocalFile::new(pipe_r, FdKind::FifoRead).unwrap();

        let err = file.write(b"abcdefg\0".to_vec(), Vec::new()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));

        // Broken files fail every later write immediately.
        let err = file.write(b"x".to_vec(), Vec::new()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
    }

    #[test]
    fn test_pread_pwrite_fstat() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"abcdefghijklmnopqrstuvwxyz").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let fd = f.as_raw_fd();

        let (errno, blob) = pread(fd, 10, 10);
        assert_eq!(errno, 0);
        assert_eq!(blob, b"klmnopqrst");

        let (errno, blob) = pread(fd, 10, 100);
        assert_eq!(errno, 0);
        assert!(blob.is_empty());

        let (errno, size) = fstat_size(fd);
        assert_eq!(errno, 0);
        assert_eq!(size, 26);

        let (errno, written) = pwrite(fd, b"ABC", 0);
        assert_eq!(errno, 0);
        assert_eq!(written, 3);
        let (_, blob) = pread(fd, 3, 0);
        assert_eq!(blob, b"ABC");
    }

    #[test]
    fn test_pread_covers_large_counts() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&data).unwrap();

        let (errno, blob) = pread(f.as_raw_fd(), data.len() as u64, 0);
        assert_eq!(errno, 0);
        assert_eq!(blob, data);

        // A count reaching past the end returns only what is there.
        let (errno, blob) = pread(f.as_raw_fd(), 1 << 20, 90_000);
        assert_eq!(errno, 0);
        assert_eq!(blob, &data[90_000..]);
    }
}

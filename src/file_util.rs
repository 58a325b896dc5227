// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Syscall helpers for creating, classifying and shuttling file descriptors.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::prelude::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, sockopt, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType,
};
use nix::unistd::pipe2;

use crate::protocol::{FdKind, MAX_TRANSFERRED_FDS};

/// Creates a connected socket pair of the given kind, non-blocking and
/// close-on-exec. Both ends are interchangeable.
pub fn create_socket_pair(kind: FdKind) -> nix::Result<(OwnedFd, OwnedFd)> {
    let ty = match kind {
        FdKind::Stream => SockType::Stream,
        FdKind::Dgram => SockType::Datagram,
        FdKind::Seqpacket => SockType::SeqPacket,
        _ => return Err(Errno::EINVAL),
    };
    socketpair(
        AddressFamily::Unix,
        ty,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
}

/// Creates a pipe, non-blocking and close-on-exec. Returns (read, write).
pub fn create_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    pipe2(nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC)
}

/// Determines how a foreign fd picked up from ancillary data must be
/// forwarded. Returns the kind and, for regular files, the open flags.
/// Fds that cannot be synthesized on the peer side classify as
/// `Transportable`.
pub fn classify_fd(fd: &OwnedFd) -> std::io::Result<(FdKind, i32)> {
    // SAFETY: fd is a valid open descriptor and st is a properly sized,
    // writable stat buffer.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    match st.st_mode & libc::S_IFMT {
        libc::S_IFSOCK => {
            let kind = match nix::sys::socket::getsockopt(fd, sockopt::SockType) {
                Ok(SockType::Stream) => FdKind::Stream,
                Ok(SockType::Datagram) => FdKind::Dgram,
                Ok(SockType::SeqPacket) => FdKind::Seqpacket,
                Ok(_) => FdKind::Transportable,
                Err(e) => return Err(e.into()),
            };
            Ok((kind, 0))
        }
        libc::S_IFIFO => {
            let flags = get_status_flags(fd.as_raw_fd())?;
            match flags & libc::O_ACCMODE {
                libc::O_WRONLY => Ok((FdKind::FifoWrite, 0)),
                _ => Ok((FdKind::FifoRead, 0)),
            }
        }
        libc::S_IFREG => {
            let flags = get_status_flags(fd.as_raw_fd())?;
            Ok((FdKind::Regular, flags))
        }
        _ => Ok((FdKind::Transportable, 0)),
    }
}

/// F_GETFL for the given fd.
pub fn get_status_flags(fd: RawFd) -> std::io::Result<i32> {
    // SAFETY: F_GETFL reads no memory through its arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(flags)
}

/// Puts the fd into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = get_status_flags(fd)?;
    // SAFETY: F_SETFL with a flags word obtained from F_GETFL.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicates the fd with close-on-exec set, for handing to a worker thread.
pub fn dup_cloexec(fd: RawFd) -> std::io::Result<OwnedFd> {
    // SAFETY: fd is valid; F_DUPFD_CLOEXEC returns a fresh descriptor that we
    // immediately take ownership of.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: dup is a newly created fd owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// sendmsg with optional SCM_RIGHTS. Returns the number of payload bytes
/// written. The fds, if any, ride with whatever prefix of `buf` the kernel
/// accepts on this call.
pub fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> nix::Result<usize> {
    let iov = [IoSlice::new(buf)];
    if fds.is_empty() {
        sendmsg::<()>(fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None)
    } else {
        let cmsgs = [ControlMessage::ScmRights(fds)];
        sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
    }
}

/// recvmsg collecting any SCM_RIGHTS fds. Returns the number of bytes read
/// (zero means EOF) and the received fds in order.
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> nix::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = cmsg_space!([RawFd; MAX_TRANSFERRED_FDS]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::MSG_CMSG_CLOEXEC)?;
    let bytes = msg.bytes;
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: raw is a live fd installed into this process by
                // recvmsg and not owned by anything else yet.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok((bytes, fds))
}

/// Blocks until the fd is readable. Test and bootstrap helper; never called
/// on the event-loop thread.
pub fn wait_readable(fd: RawFd) -> std::io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd points to one properly initialized pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Blocks until the fd is writable.
pub fn wait_writable(fd: RawFd) -> std::io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        // SAFETY: pfd points to one properly initialized pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

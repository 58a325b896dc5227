// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Name space tying local fds to cross-peer handles.
//!
//! One entry per registered fd. The entry owns the fd through its
//! [`LocalFile`]; erasing the entry closes the fd. Handles allocated here
//! follow the sign convention of the wire protocol: the server side counts
//! 1, 2, 3, …, the client side -1, -2, -3, …, zero is reserved for "unset"
//! and no handle is reused within a session.

use std::collections::HashMap;
use std::os::unix::prelude::{AsRawFd, OwnedFd, RawFd};

use log::{error, warn};

use crate::local_file::LocalFile;
use crate::protocol::FdKind;
use crate::vsock_proxy::{Error, Result, Side};

pub struct FdEntry {
    pub file: LocalFile,
    pub handle: i64,
    /// Whether the fd currently has an EPOLLIN watch installed.
    pub watching: bool,
    /// Whether the fd currently has an EPOLLOUT watch for a backed-up queue.
    pub wants_writable: bool,
}

pub struct FdRegistry {
    epoll_fd: RawFd,
    entries: HashMap<i64, FdEntry>,
    fd_to_handle: HashMap<RawFd, i64>,
    next_handle: i64,
    step: i64,
}

impl FdRegistry {
    pub fn new(side: Side, epoll_fd: RawFd) -> Self {
        let (next_handle, step) = match side {
            Side::Server => (1, 1),
            Side::Client => (-1, -1),
        };
        FdRegistry {
            epoll_fd,
            entries: HashMap::new(),
            fd_to_handle: HashMap::new(),
            next_handle,
            step,
        }
    }

    /// Allocates a fresh handle for an outgoing request or registration.
    pub fn generate_handle(&mut self) -> i64 {
        let handle = self.next_handle;
        self.next_handle += self.step;
        handle
    }

    /// Registers `fd` under `handle`, or under a freshly allocated handle
    /// when `handle == 0`. Installs a readability watch iff the kind is one
    /// the proxy reads and forwards; regular and transportable fds sit in the
    /// table unwatched. Returns the handle, or 0 on failure (duplicate
    /// handle or watch setup error).
    pub fn register(&mut self, fd: OwnedFd, kind: FdKind, handle: i64) -> i64 {
        let handle = if handle == 0 {
            self.generate_handle()
        } else {
            handle
        };
        if self.entries.contains_key(&handle) {
            error!("proxy: handle {handle} is already registered");
            return 0;
        }

        let file = match LocalFile::new(fd, kind) {
            Ok(file) => file,
            Err(e) => {
                error!("proxy: failed to prepare fd for handle {handle}: {e}");
                return 0;
            }
        };
        let raw_fd = file.as_raw_fd();

        let watching = kind.is_forwarding();
        if watching {
            if let Err(e) = epoll::ctl(
                self.epoll_fd,
                epoll::ControlOptions::EPOLL_CTL_ADD,
                raw_fd,
                epoll::Event::new(epoll::Events::EPOLLIN, raw_fd as u64),
            ) {
                error!("proxy: failed to watch fd {raw_fd} for handle {handle}: {e}");
                return 0;
            }
        }

        self.fd_to_handle.insert(raw_fd, handle);
        self.entries.insert(
            handle,
            FdEntry {
                file,
                handle,
                watching,
                wants_writable: false,
            },
        );
        handle
    }

    pub fn lookup(&mut self, handle: i64) -> Option<&mut FdEntry> {
        self.entries.get_mut(&handle)
    }

    pub fn handle_for_fd(&self, fd: RawFd) -> Option<i64> {
        self.fd_to_handle.get(&fd).copied()
    }

    /// Arms or disarms the EPOLLOUT watch for a handle whose write queue is
    /// backed up or has drained.
    pub fn set_wants_writable(&mut self, handle: i64, wants: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(Error::MalformedMessage("unknown handle for epoll update"))?;
        if entry.wants_writable == wants {
            return Ok(());
        }

        let raw_fd = entry.file.as_raw_fd();
        let mut events = epoll::Events::empty();
        if entry.watching {
            events |= epoll::Events::EPOLLIN;
        }
        if wants {
            events |= epoll::Events::EPOLLOUT;
        }

        let op = if entry.watching || entry.wants_writable {
            epoll::ControlOptions::EPOLL_CTL_MOD
        } else {
            epoll::ControlOptions::EPOLL_CTL_ADD
        };
        // Disarming an entry that was only registered for EPOLLOUT removes it
        // from the epoll set entirely.
        if events.is_empty() {
            epoll::ctl(
                self.epoll_fd,
                epoll::ControlOptions::EPOLL_CTL_DEL,
                raw_fd,
                epoll::Event::new(epoll::Events::empty(), 0),
            )
            .map_err(Error::EpollRemove)?;
        } else {
            epoll::ctl(
                self.epoll_fd,
                op,
                raw_fd,
                epoll::Event::new(events, raw_fd as u64),
            )
            .map_err(Error::EpollModify)?;
        }
        entry.wants_writable = wants;
        Ok(())
    }

    /// Removes the entry, cancels its watch and closes its fd. Erasing an
    /// unknown handle is a no-op: a local read error and a peer-initiated
    /// Close may race.
    pub fn erase(&mut self, handle: i64) {
        let Some(entry) = self.entries.remove(&handle) else {
            return;
        };
        let raw_fd = entry.file.as_raw_fd();
        self.fd_to_handle.remove(&raw_fd);
        if entry.watching || entry.wants_writable {
            if let Err(e) = epoll::ctl(
                self.epoll_fd,
                epoll::ControlOptions::EPOLL_CTL_DEL,
                raw_fd,
                epoll::Event::new(epoll::Events::empty(), 0),
            ) {
                warn!("proxy: failed to unwatch fd {raw_fd} for handle {handle}: {e}");
            }
        }
        // Dropping the entry closes the fd.
    }

    /// Drops every entry, closing all owned fds. Used at shutdown.
    pub fn clear(&mut self) {
        let handles: Vec<i64> = self.entries.keys().copied().collect();
        for handle in handles {
            self.erase(handle);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_util::create_socket_pair;

    fn test_registry(side: Side) -> FdRegistry {
        let epoll_fd = epoll::create(true).unwrap();
        FdRegistry::new(side, epoll_fd)
    }

    #[test]
    fn test_server_handles_are_positive_and_unique() {
        let mut registry = test_registry(Side::Server);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let (a, _b) = create_socket_pair(FdKind::Stream).unwrap();
            let handle = registry.register(a, FdKind::Stream, 0);
            assert!(handle > 0);
            assert!(!seen.contains(&handle));
            seen.push(handle);
        }
    }

    #[test]
    fn test_client_handles_are_negative() {
        let mut registry = test_registry(Side::Client);
        let (a, _b) = create_socket_pair(FdKind::Stream).unwrap();
        assert!(registry.register(a, FdKind::Stream, 0) < 0);
    }

    #[test]
    fn test_duplicate_handle_is_rejected() {
        let mut registry = test_registry(Side::Server);
        let (a, _b) = create_socket_pair(FdKind::Stream).unwrap();
        let (c, _d) = create_socket_pair(FdKind::Stream).unwrap();
        let handle = registry.register(a, FdKind::Stream, 0);
        assert_ne!(handle, 0);
        assert_eq!(registry.register(c, FdKind::Stream, handle), 0);
    }

    #[test]
    fn test_handles_are_not_reused_after_erase() {
        let mut registry = test_registry(Side::Server);
        let (a, _b) = create_socket_pair(FdKind::Stream).unwrap();
        let first = registry.register(a, FdKind::Stream, 0);
        registry.erase(first);
        let (c, _d) = create_socket_pair(FdKind::Stream).unwrap();
        let second = registry.register(c, FdKind::Stream, 0);
        assert_ne!(first, second);
    }

    #[test]
    fn test_erase_unknown_handle_is_noop() {
        let mut registry = test_registry(Side::Server);
        registry.erase(42);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_erase_closes_the_fd() {
        let mut registry = test_registry(Side::Server);
        let (a, b) = create_socket_pair(FdKind::Stream).unwrap();
        let handle = registry.register(a, FdKind::Stream, 0);
        registry.erase(handle);

        // The peer end observes EOF once the registry drops its fd.
        let mut buf = [0u8; 8];
        let (n, _) = crate::file_util::recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 0);
    }
}

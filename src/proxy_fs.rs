// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! FUSE filesystem backing remote regular-file handles.
//!
//! When a Data message carries a regular-file description, the receiving
//! proxy mints a local fd by opening a node on this filesystem. Reads and
//! writes on that fd become pread/pwrite requests to the peer; fstat becomes
//! a size query. Lookup, open, and any getattr issued while a node is being
//! registered are answered from the node table alone, so the event-loop
//! thread can safely open a freshly registered node while the session thread
//! serves the kernel.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::prelude::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request,
};
use log::{info, warn};

use crate::vsock_proxy::ProxyHandle;

const ROOT_INO: u64 = 1;
const ATTR_TTL: Duration = Duration::ZERO;

#[derive(Clone, Copy)]
struct Node {
    ino: u64,
    handle: i64,
    open_count: u32,
    // While the event-loop thread is inside open(2) on this node, kernel
    // requests must be answered from the table alone.
    registering: bool,
}

/// Nodes are named by their handle's decimal representation directly under
/// the mount root. Inos start at 2; 1 is the root directory.
struct NodeTable {
    by_ino: HashMap<u64, Node>,
    ino_by_handle: HashMap<i64, u64>,
    next_ino: u64,
}

impl NodeTable {
    fn new() -> Self {
        NodeTable {
            by_ino: HashMap::new(),
            ino_by_handle: HashMap::new(),
            next_ino: ROOT_INO + 1,
        }
    }

    fn add(&mut self, handle: i64) -> u64 {
        if let Some(ino) = self.ino_by_handle.get(&handle) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(
            ino,
            Node {
                ino,
                handle,
                open_count: 0,
                registering: false,
            },
        );
        self.ino_by_handle.insert(handle, ino);
        ino
    }

    fn get(&self, ino: u64) -> Option<Node> {
        self.by_ino.get(&ino).copied()
    }

    fn set_registering(&mut self, ino: u64, registering: bool) {
        if let Some(node) = self.by_ino.get_mut(&ino) {
            node.registering = registering;
        }
    }

    fn find_by_name(&self, name: &OsStr) -> Option<Node> {
        let handle: i64 = name.to_str()?.parse().ok()?;
        let ino = self.ino_by_handle.get(&handle)?;
        self.get(*ino)
    }

    fn remove(&mut self, ino: u64) {
        if let Some(node) = self.by_ino.remove(&ino) {
            self.ino_by_handle.remove(&node.handle);
        }
    }

    fn adjust_open_count(&mut self, ino: u64, delta: i32) -> Option<Node> {
        let node = self.by_ino.get_mut(&ino)?;
        node.open_count = node.open_count.saturating_add_signed(delta);
        Some(*node)
    }
}

/// A mounted proxy filesystem session.
///
/// Owns the background FUSE session; dropping it unmounts.
pub struct ProxyFsMount {
    nodes: Arc<Mutex<NodeTable>>,
    mount_point: PathBuf,
    _session: fuser::BackgroundSession,
}

impl ProxyFsMount {
    pub fn mount(mount_point: &Path, proxy: ProxyHandle) -> std::io::Result<Self> {
        let nodes = Arc::new(Mutex::new(NodeTable::new()));
        let fs = ProxyFileSystem {
            nodes: nodes.clone(),
            proxy,
        };
        let options = [
            MountOption::FSName("vsockproxy".to_string()),
            MountOption::DefaultPermissions,
        ];
        let session = fuser::spawn_mount2(fs, mount_point, &options)?;
        info!("proxy: mounted proxy filesystem at {}", mount_point.display());
        Ok(ProxyFsMount {
            nodes,
            mount_point: mount_point.to_path_buf(),
            _session: session,
        })
    }

    /// Creates the node for a freshly received regular-file handle and opens
    /// it with the sender's access mode. This runs on the event-loop thread,
    /// so every kernel request the open can trigger (lookup, the permission
    /// getattr, open) is answered from the node table; the registering mark
    /// keeps getattr from issuing a proxy call that would need the very
    /// thread blocked in open(2).
    pub fn register_handle(&self, handle: i64, flags: i32) -> std::io::Result<OwnedFd> {
        let ino = {
            let mut nodes = self.nodes.lock().unwrap();
            let ino = nodes.add(handle);
            nodes.set_registering(ino, true);
            ino
        };
        let result = open_node(&self.mount_point, handle, flags);
        self.nodes.lock().unwrap().set_registering(ino, false);
        result
    }
}

fn open_node(mount_point: &Path, handle: i64, flags: i32) -> std::io::Result<OwnedFd> {
    let path = mount_point.join(handle.to_string());
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
    let open_flags = (flags & libc::O_ACCMODE) | libc::O_CLOEXEC;
    // SAFETY: path is a valid NUL-terminated string for the duration of
    // the call.
    let fd = unsafe { libc::open(path.as_ptr(), open_flags) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd is a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

struct ProxyFileSystem {
    nodes: Arc<Mutex<NodeTable>>,
    proxy: ProxyHandle,
}

impl ProxyFileSystem {
    fn file_attr(&self, ino: u64, size: i64) -> FileAttr {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        FileAttr {
            ino,
            size: size.max(0) as u64,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o600,
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn root_attr(&self) -> FileAttr {
        let mut attr = self.file_attr(ROOT_INO, 0);
        attr.kind = FileType::Directory;
        attr.perm = 0o700;
        attr.nlink = 2;
        attr
    }
}

/// The peer going away turns into EIO at the filesystem boundary; every
/// other errno passes through unchanged.
fn map_errno(errno: i32) -> i32 {
    if errno == libc::ECONNRESET {
        libc::EIO
    } else {
        errno
    }
}

impl Filesystem for ProxyFileSystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let node = self.nodes.lock().unwrap().find_by_name(name);
        match node {
            // Size comes from getattr when somebody asks; reads use direct
            // I/O and never consult it.
            Some(node) => reply.entry(&ATTR_TTL, &self.file_attr(node.ino, 0), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&ATTR_TTL, &self.root_attr());
            return;
        }
        let node = self.nodes.lock().unwrap().get(ino);
        let Some(node) = node else {
            reply.error(libc::ENOENT);
            return;
        };
        // Mid-registration the size is not known yet; direct I/O means
        // nothing reads it from here anyway.
        if node.registering {
            reply.attr(&ATTR_TTL, &self.file_attr(ino, 0));
            return;
        }
        let (errno, size) = self.proxy.fstat(node.handle);
        if errno != 0 {
            reply.error(map_errno(errno));
            return;
        }
        reply.attr(&ATTR_TTL, &self.file_attr(ino, size));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = self.nodes.lock().unwrap().adjust_open_count(ino, 1);
        match node {
            Some(_) => reply.opened(0, FOPEN_DIRECT_IO),
            None => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let node = self.nodes.lock().unwrap().get(ino);
        let Some(node) = node else {
            reply.error(libc::ENOENT);
            return;
        };
        let (errno, blob) = self.proxy.pread(node.handle, size as u64, offset.max(0) as u64);
        if errno != 0 {
            reply.error(map_errno(errno));
            return;
        }
        reply.data(&blob);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let node = self.nodes.lock().unwrap().get(ino);
        let Some(node) = node else {
            reply.error(libc::ENOENT);
            return;
        };
        let (errno, written) = self
            .proxy
            .pwrite(node.handle, data.to_vec(), offset.max(0) as u64);
        if errno != 0 {
            reply.error(map_errno(errno));
            return;
        }
        reply.written(written.max(0) as u32);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let node = self.nodes.lock().unwrap().adjust_open_count(ino, -1);
        if let Some(node) = node {
            if node.open_count == 0 {
                self.nodes.lock().unwrap().remove(ino);
                // Releases the peer-side entry as well.
                self.proxy.close(node.handle);
            }
        } else {
            warn!("proxy: release for unknown ino {ino}");
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_table_add_and_find() {
        let mut table = NodeTable::new();
        let ino = table.add(-7);
        assert!(ino > ROOT_INO);
        assert_eq!(table.add(-7), ino);
        let node = table.find_by_name(OsStr::new("-7")).unwrap();
        assert_eq!(node.ino, ino);
        assert_eq!(node.handle, -7);
        assert!(table.find_by_name(OsStr::new("8")).is_none());
        assert!(table.find_by_name(OsStr::new("not-a-handle")).is_none());
    }

    #[test]
    fn test_node_table_inos_are_unique() {
        let mut table = NodeTable::new();
        let a = table.add(1);
        let b = table.add(2);
        assert_ne!(a, b);
        table.remove(a);
        let c = table.add(3);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_node_table_open_count() {
        let mut table = NodeTable::new();
        let ino = table.add(5);
        assert_eq!(table.adjust_open_count(ino, 1).unwrap().open_count, 1);
        assert_eq!(table.adjust_open_count(ino, 1).unwrap().open_count, 2);
        assert_eq!(table.adjust_open_count(ino, -1).unwrap().open_count, 1);
        assert_eq!(table.adjust_open_count(ino, -1).unwrap().open_count, 0);
        assert!(table.adjust_open_count(99, 1).is_none());
    }

    #[test]
    fn test_registering_window_is_tracked() {
        let mut table = NodeTable::new();
        let ino = table.add(3);
        assert!(!table.get(ino).unwrap().registering);
        table.set_registering(ino, true);
        assert!(table.get(ino).unwrap().registering);
        table.set_registering(ino, false);
        assert!(!table.get(ino).unwrap().registering);
        // Unknown inos are ignored.
        table.set_registering(99, true);
        assert!(table.get(99).is_none());
    }

    #[test]
    fn test_remove_forgets_the_handle() {
        let mut table = NodeTable::new();
        let ino = table.add(4);
        table.remove(ino);
        assert!(table.get(ino).is_none());
        assert!(table.find_by_name(OsStr::new("4")).is_none());
    }
}

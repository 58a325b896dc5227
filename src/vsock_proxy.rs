// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The proxy core.
//!
//! One [`VsockProxy`] per process, driving a single epoll-based event loop:
//! it dispatches messages arriving on the peer transport, forwards bytes read
//! from registered local fds, correlates request/response pairs by cookie,
//! and ships blocking regular-file syscalls to a small worker pool. All proxy
//! state is touched only from the event-loop thread; other threads reach it
//! by posting tasks through a [`ProxyHandle`].

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;
use std::os::unix::prelude::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};
use thiserror::Error as ThisError;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::fd_registry::FdRegistry;
use crate::file_util;
use crate::local_file::{self, ReadResult, WriteStatus};
use crate::message_stream::MessageStream;
use crate::pending::PendingCalls;
use crate::protocol::{FdDescription, FdKind, VsockMessage};

/// Number of threads servicing blocking pread/pwrite/fstat calls.
const BLOCKING_WORKER_COUNT: usize = 2;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("transport closed by peer")]
    TransportClosed,
    #[error("transport I/O failure: {0}")]
    TransportError(std::io::Error),
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    #[error("fd passing from host to guest is not allowed")]
    FdPassingDisallowed,
    #[error("failed to create epoll fd: {0}")]
    EpollFdCreate(std::io::Error),
    #[error("failed to add fd to epoll: {0}")]
    EpollAdd(std::io::Error),
    #[error("failed to remove fd from epoll: {0}")]
    EpollRemove(std::io::Error),
    #[error("failed to modify fd in epoll: {0}")]
    EpollModify(std::io::Error),
    #[error("failed to create eventfd: {0}")]
    EventFdCreate(std::io::Error),
    #[error("failed to bind unix socket: {0}")]
    UnixBind(std::io::Error),
    #[error("failed to accept unix connection: {0}")]
    UnixAccept(std::io::Error),
    #[error("failed to connect unix socket: {0}")]
    UnixConnect(std::io::Error),
    #[error("failed to mount proxy filesystem: {0}")]
    FuseMount(std::io::Error),
}

/// Which end of the pair this proxy runs as. The server owns host resources
/// and allocates positive handles and cookies; the client allocates negative
/// ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

pub type ConnectCallback = Box<dyn FnOnce(i32, i64) + Send>;
pub type PreadCallback = Box<dyn FnOnce(i32, Vec<u8>) + Send>;
pub type PwriteCallback = Box<dyn FnOnce(i32, i64) + Send>;
pub type FstatCallback = Box<dyn FnOnce(i32, i64) + Send>;

/// Hooks the embedding daemon supplies to the proxy core.
pub trait ProxyDelegate: Send {
    /// Mints a local fd for a remote regular-file handle, typically by
    /// opening it through the proxy filesystem.
    fn create_proxied_regular_file(&mut self, handle: i64, flags: i32)
        -> std::io::Result<OwnedFd>;

    /// Called exactly once when the proxy stops.
    fn on_stopped(&mut self);
}

type Task = Box<dyn FnOnce(&mut VsockProxy) + Send>;

struct PostQueue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

struct HandleShared {
    queue: Mutex<PostQueue>,
    wake: EventFd,
}

/// Cloneable, thread-safe entry point into the event loop.
///
/// `post` marshals a closure onto the event-loop thread. The blocking
/// wrappers are what the proxy filesystem thread (and tests) use; they must
/// never be called from the event-loop thread itself.
#[derive(Clone)]
pub struct ProxyHandle {
    shared: Arc<HandleShared>,
}

impl ProxyHandle {
    pub fn post(&self, task: impl FnOnce(&mut VsockProxy) + Send + 'static) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.stopped {
                return Err(Error::TransportClosed);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.wake.write(1).map_err(Error::TransportError)
    }

    pub fn register_file_descriptor(&self, fd: OwnedFd, kind: FdKind, handle: i64) -> i64 {
        let (tx, rx) = mpsc::channel();
        let posted = self.post(move |proxy| {
            let _ = tx.send(proxy.register_file_descriptor(fd, kind, handle));
        });
        if posted.is_err() {
            return 0;
        }
        rx.recv().unwrap_or(0)
    }

    pub fn connect(&self, path: &Path) -> (i32, i64) {
        let (tx, rx) = mpsc::channel();
        let path = path.to_path_buf();
        let posted = self.post(move |proxy| {
            proxy.connect(
                &path,
                Box::new(move |error_code, handle| {
                    let _ = tx.send((error_code, handle));
                }),
            );
        });
        if posted.is_err() {
            return (libc::ECONNRESET, 0);
        }
        rx.recv().unwrap_or((libc::ECONNRESET, 0))
    }

    pub fn pread(&self, handle: i64, count: u64, offset: u64) -> (i32, Vec<u8>) {
        let (tx, rx) = mpsc::channel();
        let posted = self.post(move |proxy| {
            proxy.pread(
                handle,
                count,
                offset,
                Box::new(move |error_code, blob| {
                    let _ = tx.send((error_code, blob));
                }),
            );
        });
        if posted.is_err() {
            return (libc::ECONNRESET, Vec::new());
        }
        rx.recv().unwrap_or((libc::ECONNRESET, Vec::new()))
    }

    pub fn pwrite(&self, handle: i64, blob: Vec<u8>, offset: u64) -> (i32, i64) {
        let (tx, rx) = mpsc::channel();
        let posted = self.post(move |proxy| {
            proxy.pwrite(
                handle,
                blob,
                offset,
                Box::new(move |error_code, written| {
                    let _ = tx.send((error_code, written));
                }),
            );
        });
        if posted.is_err() {
            return (libc::ECONNRESET, 0);
        }
        rx.recv().unwrap_or((libc::ECONNRESET, 0))
    }

    pub fn fstat(&self, handle: i64) -> (i32, i64) {
        let (tx, rx) = mpsc::channel();
        let posted = self.post(move |proxy| {
            proxy.fstat(
                handle,
                Box::new(move |error_code, size| {
                    let _ = tx.send((error_code, size));
                }),
            );
        });
        if posted.is_err() {
            return (libc::ECONNRESET, 0);
        }
        rx.recv().unwrap_or((libc::ECONNRESET, 0))
    }

    pub fn close(&self, handle: i64) {
        let _ = self.post(move |proxy| proxy.close(handle));
    }

    pub fn stop(&self) {
        let _ = self.post(|proxy| proxy.stop());
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Threads for the blocking regular-file syscalls. Workers receive only
/// primitives (a dup'ed fd, offsets, a blob) and post their result back onto
/// the event loop; they never touch proxy state.
struct WorkerPool {
    sender: mpsc::Sender<Job>,
}

impl WorkerPool {
    fn new(count: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for _ in 0..count {
            let receiver = receiver.clone();
            thread::spawn(move || loop {
                let job = receiver.lock().unwrap().recv();
                let Ok(job) = job else {
                    break;
                };
                job();
            });
        }
        WorkerPool { sender }
    }

    fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }
}

pub struct VsockProxy {
    side: Side,
    /// Owns the epoll fd.
    epoll_file: File,
    stream: MessageStream,
    registry: FdRegistry,
    pending_connect: PendingCalls<ConnectCallback>,
    pending_pread: PendingCalls<PreadCallback>,
    pending_pwrite: PendingCalls<PwriteCallback>,
    pending_fstat: PendingCalls<FstatCallback>,
    next_cookie: i64,
    cookie_step: i64,
    workers: WorkerPool,
    delegate: Box<dyn ProxyDelegate>,
    shared: Arc<HandleShared>,
    wake: EventFd,
    stopped: bool,
}

impl VsockProxy {
    pub fn new(side: Side, transport: UnixStream, delegate: Box<dyn ProxyDelegate>) -> Result<Self> {
        let epoll_fd = epoll::create(true).map_err(Error::EpollFdCreate)?;
        // SAFETY: epoll_fd is a fresh fd owned by nobody else.
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };

        let stream = MessageStream::new(transport)?;
        let wake = EventFd::new(EFD_NONBLOCK).map_err(Error::EventFdCreate)?;
        let wake_for_posters = wake.try_clone().map_err(Error::EventFdCreate)?;

        for fd in [stream.as_raw_fd(), wake.as_raw_fd()] {
            epoll::ctl(
                epoll_fd,
                epoll::ControlOptions::EPOLL_CTL_ADD,
                fd,
                epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
            )
            .map_err(Error::EpollAdd)?;
        }

        let (next_cookie, cookie_step) = match side {
            Side::Server => (1, 1),
            Side::Client => (-1, -1),
        };

        info!("proxy: {side:?} started on transport fd {}", stream.as_raw_fd());
        Ok(VsockProxy {
            side,
            epoll_file,
            stream,
            registry: FdRegistry::new(side, epoll_fd),
            pending_connect: PendingCalls::new(),
            pending_pread: PendingCalls::new(),
            pending_pwrite: PendingCalls::new(),
            pending_fstat: PendingCalls::new(),
            next_cookie,
            cookie_step,
            workers: WorkerPool::new(BLOCKING_WORKER_COUNT),
            delegate,
            shared: Arc::new(HandleShared {
                queue: Mutex::new(PostQueue {
                    tasks: VecDeque::new(),
                    stopped: false,
                }),
                wake: wake_for_posters,
            }),
            wake,
            stopped: false,
        })
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drives the event loop until the proxy stops.
    pub fn run(&mut self) {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 32];
        while !self.stopped {
            let count = match epoll::wait(self.epoll_file.as_raw_fd(), -1, &mut events) {
                Ok(count) => count,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("proxy: epoll_wait failed: {e}");
                    self.stop();
                    break;
                }
            };
            for event in events.iter().take(count) {
                let fd = event.data as RawFd;
                let evset = epoll::Events::from_bits_truncate(event.events);
                self.handle_epoll_event(fd, evset);
                if self.stopped {
                    break;
                }
            }
        }
    }

    fn handle_epoll_event(&mut self, fd: RawFd, evset: epoll::Events) {
        if fd == self.wake.as_raw_fd() {
            let _ = self.wake.read();
            self.run_posted_tasks();
        } else if fd == self.stream.as_raw_fd() {
            self.on_transport_readable();
        } else if let Some(handle) = self.registry.handle_for_fd(fd) {
            if evset.contains(epoll::Events::EPOLLOUT) {
                self.on_local_file_writable(handle);
            }
            if self.stopped {
                return;
            }
            if evset.contains(epoll::Events::EPOLLIN)
                || evset.contains(epoll::Events::EPOLLHUP)
                || evset.contains(epoll::Events::EPOLLERR)
            {
                self.on_local_file_readable(handle);
            }
        }
        // A stale fd can fire once after an erase; nothing to do.
    }

    fn run_posted_tasks(&mut self) {
        loop {
            let task = self.shared.queue.lock().unwrap().tasks.pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    // ---- Inbound dispatch ------------------------------------------------

    fn on_transport_readable(&mut self) {
        loop {
            match self.stream.read_message() {
                Ok(Some((message, fds))) => {
                    if let Err(e) = self.handle_message(message, fds) {
                        error!("proxy: protocol error: {e}");
                        self.stop();
                        return;
                    }
                    if self.stopped {
                        return;
                    }
                }
                Ok(None) => return,
                Err(Error::TransportClosed) => {
                    info!("proxy: transport closed by peer");
                    self.stop();
                    return;
                }
                Err(e) => {
                    error!("proxy: transport failure: {e}");
                    self.stop();
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, message: VsockMessage, received: Vec<OwnedFd>) -> Result<()> {
        // The host never ships raw fds; a client that receives some is
        // talking to a misbehaving peer.
        if self.side == Side::Client && !received.is_empty() {
            return Err(Error::FdPassingDisallowed);
        }
        match message {
            VsockMessage::Close { handle } => {
                self.registry.erase(handle);
                Ok(())
            }
            VsockMessage::Data { handle, blob, fds } => self.on_data(handle, blob, fds, received),
            VsockMessage::ConnectRequest { cookie, path } => {
                self.on_connect_request(cookie, path);
                Ok(())
            }
            VsockMessage::ConnectResponse {
                cookie,
                error_code,
                handle,
            } => {
                let Some(callback) = self.pending_connect.take(cookie) else {
                    return Err(Error::MalformedMessage("unknown connect cookie"));
                };
                callback(error_code, handle);
                Ok(())
            }
            VsockMessage::PreadRequest {
                cookie,
                handle,
                count,
                offset,
            } => {
                self.on_pread_request(cookie, handle, count, offset);
                Ok(())
            }
            VsockMessage::PreadResponse {
                cookie,
                error_code,
                blob,
            } => {
                let Some(callback) = self.pending_pread.take(cookie) else {
                    return Err(Error::MalformedMessage("unknown pread cookie"));
                };
                callback(error_code, blob);
                Ok(())
            }
            VsockMessage::PwriteRequest {
                cookie,
                handle,
                blob,
                offset,
            } => {
                self.on_pwrite_request(cookie, handle, blob, offset);
                Ok(())
            }
            VsockMessage::PwriteResponse {
                cookie,
                error_code,
                bytes_written,
            } => {
                let Some(callback) = self.pending_pwrite.take(cookie) else {
                    return Err(Error::MalformedMessage("unknown pwrite cookie"));
                };
                callback(error_code, bytes_written);
                Ok(())
            }
            VsockMessage::FstatRequest { cookie, handle } => {
                self.on_fstat_request(cookie, handle);
                Ok(())
            }
            VsockMessage::FstatResponse {
                cookie,
                error_code,
                size,
            } => {
                let Some(callback) = self.pending_fstat.take(cookie) else {
                    return Err(Error::MalformedMessage("unknown fstat cookie"));
                };
                callback(error_code, size);
                Ok(())
            }
        }
    }

    /// Re-materializes the fds described in a Data message and appends the
    /// payload to the target fd's write queue.
    fn on_data(
        &mut self,
        handle: i64,
        blob: Vec<u8>,
        descriptions: Vec<FdDescription>,
        received: Vec<OwnedFd>,
    ) -> Result<()> {
        let mut received = received.into_iter();
        let mut produced: Vec<OwnedFd> = Vec::with_capacity(descriptions.len());
        for desc in &descriptions {
            match desc.kind {
                FdKind::Transportable => {
                    let fd = received
                        .next()
                        .ok_or(Error::MalformedMessage("missing transported fd"))?;
                    // We own the object now; tell the sender to drop its copy.
                    self.send_message(&VsockMessage::Close { handle: desc.handle }, &[]);
                    produced.push(fd);
                }
                FdKind::Regular => {
                    match self
                        .delegate
                        .create_proxied_regular_file(desc.handle, desc.flags)
                    {
                        Ok(fd) => produced.push(fd),
                        Err(e) => {
                            error!(
                                "proxy: failed to create proxied file for handle {}: {e}",
                                desc.handle
                            );
                            self.send_message(&VsockMessage::Close { handle: desc.handle }, &[]);
                        }
                    }
                }
                // Synthesis failure (fd exhaustion, mostly) costs only the
                // described channel: the sender's entry is released with a
                // Close and the rest of the message still goes through.
                FdKind::Stream | FdKind::Dgram | FdKind::Seqpacket => {
                    match file_util::create_socket_pair(desc.kind) {
                        Ok((ours, theirs)) => {
                            if self.registry.register(ours, desc.kind, desc.handle) == 0 {
                                return Err(Error::MalformedMessage(
                                    "duplicate handle in data message",
                                ));
                            }
                            produced.push(theirs);
                        }
                        Err(e) => {
                            warn!(
                                "proxy: failed to create socket pair for handle {}: {e}",
                                desc.handle
                            );
                            self.send_message(&VsockMessage::Close { handle: desc.handle }, &[]);
                        }
                    }
                }
                FdKind::FifoRead => {
                    // The local consumer reads; our registered write end feeds
                    // it with the peer's Data.
                    match file_util::create_pipe() {
                        Ok((read_end, write_end)) => {
                            if self.registry.register(write_end, FdKind::FifoWrite, desc.handle)
                                == 0
                            {
                                return Err(Error::MalformedMessage(
                                    "duplicate handle in data message",
                                ));
                            }
                            produced.push(read_end);
                        }
                        Err(e) => {
                            warn!(
                                "proxy: failed to create pipe for handle {}: {e}",
                                desc.handle
                            );
                            self.send_message(&VsockMessage::Close { handle: desc.handle }, &[]);
                        }
                    }
                }
                FdKind::FifoWrite => {
                    // The local consumer writes; our registered read end
                    // forwards what it writes back to the peer.
                    match file_util::create_pipe() {
                        Ok((read_end, write_end)) => {
                            if self.registry.register(read_end, FdKind::FifoRead, desc.handle) == 0
                            {
                                return Err(Error::MalformedMessage(
                                    "duplicate handle in data message",
                                ));
                            }
                            produced.push(write_end);
                        }
                        Err(e) => {
                            warn!(
                                "proxy: failed to create pipe for handle {}: {e}",
                                desc.handle
                            );
                            self.send_message(&VsockMessage::Close { handle: desc.handle }, &[]);
                        }
                    }
                }
            }
        }
        let leftover = received.count();
        if leftover != 0 {
            return Err(Error::MalformedMessage("undescribed transported fds"));
        }

        let status = match self.registry.lookup(handle) {
            Some(entry) => Some(entry.file.write(blob, produced)),
            None => None,
        };
        let Some(status) = status else {
            // The local end is already gone; a Close from us may still be in
            // flight toward the peer. Drop the bytes and repeat the Close.
            warn!("proxy: dropping data for unknown handle {handle}");
            self.send_message(&VsockMessage::Close { handle }, &[]);
            return Ok(());
        };
        match status {
            Ok(WriteStatus::Done) => {}
            Ok(WriteStatus::Pending) => {
                if let Err(e) = self.registry.set_wants_writable(handle, true) {
                    error!("proxy: failed to arm write watch for handle {handle}: {e}");
                    self.handle_local_file_error(handle);
                }
            }
            Err(e) => {
                warn!("proxy: write to handle {handle} failed: {e}");
                self.handle_local_file_error(handle);
            }
        }
        Ok(())
    }

    fn on_connect_request(&mut self, cookie: i64, path: Vec<u8>) {
        let path = std::path::PathBuf::from(std::ffi::OsString::from_vec(path));
        let (error_code, handle) = match UnixStream::connect(&path) {
            Ok(stream) => {
                let handle = self
                    .registry
                    .register(OwnedFd::from(stream), FdKind::Stream, 0);
                if handle == 0 {
                    (libc::EIO, 0)
                } else {
                    info!("proxy: connected to {} as handle {handle}", path.display());
                    (0, handle)
                }
            }
            Err(e) => {
                warn!("proxy: connect to {} failed: {e}", path.display());
                (e.raw_os_error().unwrap_or(libc::EIO), 0)
            }
        };
        self.send_message(
            &VsockMessage::ConnectResponse {
                cookie,
                error_code,
                handle,
            },
            &[],
        );
    }

    fn on_pread_request(&mut self, cookie: i64, handle: i64, count: u64, offset: u64) {
        let fd = match self.dup_for_worker(handle) {
            Ok(fd) => fd,
            Err(error_code) => {
                self.send_message(
                    &VsockMessage::PreadResponse {
                        cookie,
                        error_code,
                        blob: Vec::new(),
                    },
                    &[],
                );
                return;
            }
        };
        let proxy = self.handle();
        self.workers.execute(move || {
            let (error_code, blob) = local_file::pread(fd.as_raw_fd(), count, offset);
            drop(fd);
            let _ = proxy.post(move |proxy| {
                proxy.send_message(
                    &VsockMessage::PreadResponse {
                        cookie,
                        error_code,
                        blob,
                    },
                    &[],
                );
            });
        });
    }

    fn on_pwrite_request(&mut self, cookie: i64, handle: i64, blob: Vec<u8>, offset: u64) {
        let fd = match self.dup_for_worker(handle) {
            Ok(fd) => fd,
            Err(error_code) => {
                self.send_message(
                    &VsockMessage::PwriteResponse {
                        cookie,
                        error_code,
                        bytes_written: 0,
                    },
                    &[],
                );
                return;
            }
        };
        let proxy = self.handle();
        self.workers.execute(move || {
            let (error_code, bytes_written) = local_file::pwrite(fd.as_raw_fd(), &blob, offset);
            drop(fd);
            let _ = proxy.post(move |proxy| {
                proxy.send_message(
                    &VsockMessage::PwriteResponse {
                        cookie,
                        error_code,
                        bytes_written,
                    },
                    &[],
                );
            });
        });
    }

    fn on_fstat_request(&mut self, cookie: i64, handle: i64) {
        let fd = match self.dup_for_worker(handle) {
            Ok(fd) => fd,
            Err(error_code) => {
                self.send_message(
                    &VsockMessage::FstatResponse {
                        cookie,
                        error_code,
                        size: 0,
                    },
                    &[],
                );
                return;
            }
        };
        let proxy = self.handle();
        self.workers.execute(move || {
            let (error_code, size) = local_file::fstat_size(fd.as_raw_fd());
            drop(fd);
            let _ = proxy.post(move |proxy| {
                proxy.send_message(
                    &VsockMessage::FstatResponse {
                        cookie,
                        error_code,
                        size,
                    },
                    &[],
                );
            });
        });
    }

    /// Pins a registered fd for a worker thread. The worker gets only the
    /// dup, never a registry reference.
    fn dup_for_worker(&mut self, handle: i64) -> std::result::Result<OwnedFd, i32> {
        let Some(entry) = self.registry.lookup(handle) else {
            return Err(libc::EBADF);
        };
        file_util::dup_cloexec(entry.file.as_raw_fd())
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    // ---- Outbound from local reads ---------------------------------------

    fn on_local_file_readable(&mut self, handle: i64) {
        let Some(entry) = self.registry.lookup(handle) else {
            return;
        };
        let read = entry.file.read();
        match read {
            Ok(ReadResult::WouldBlock) => {}
            Ok(ReadResult::Eof) => {
                self.handle_local_file_error(handle);
            }
            Ok(ReadResult::Data { blob, fds }) => {
                let descriptions = if fds.is_empty() {
                    Some((Vec::new(), Vec::new()))
                } else {
                    self.convert_outgoing_fds(fds)
                };
                match descriptions {
                    Some((fds, raw_fds)) => {
                        self.send_message(&VsockMessage::Data { handle, blob, fds }, &raw_fds);
                    }
                    None => self.handle_local_file_error(handle),
                }
            }
            Err(e) => {
                warn!("proxy: read from handle {handle} failed: {e}");
                self.handle_local_file_error(handle);
            }
        }
    }

    /// Classifies fds read from a local socket and turns them into wire
    /// descriptions. Synthesizable kinds are registered under fresh handles;
    /// anything else travels as a transportable fd on the ancillary channel,
    /// which only the client may do. Returns `None` on failure, with every
    /// handle registered by this call rolled back.
    fn convert_outgoing_fds(
        &mut self,
        fds: Vec<OwnedFd>,
    ) -> Option<(Vec<FdDescription>, Vec<RawFd>)> {
        let mut descriptions = Vec::with_capacity(fds.len());
        let mut raw_fds = Vec::new();
        let mut registered = Vec::new();
        for fd in fds {
            let (kind, flags) = match file_util::classify_fd(&fd) {
                Ok(classified) => classified,
                Err(e) => {
                    warn!("proxy: failed to classify passed fd: {e}");
                    self.rollback_handles(&registered);
                    return None;
                }
            };
            if kind == FdKind::Transportable && self.side == Side::Server {
                error!("proxy: {}", Error::FdPassingDisallowed);
                self.rollback_handles(&registered);
                return None;
            }
            let raw_fd = fd.as_raw_fd();
            let new_handle = self.registry.register(fd, kind, 0);
            if new_handle == 0 {
                self.rollback_handles(&registered);
                return None;
            }
            registered.push(new_handle);
            if kind == FdKind::Transportable {
                // The registry keeps our copy alive until the peer confirms
                // receipt with a Close for this handle.
                raw_fds.push(raw_fd);
            }
            descriptions.push(FdDescription {
                kind,
                handle: new_handle,
                flags,
            });
        }
        Some((descriptions, raw_fds))
    }

    fn rollback_handles(&mut self, handles: &[i64]) {
        for handle in handles {
            self.registry.erase(*handle);
        }
    }

    fn on_local_file_writable(&mut self, handle: i64) {
        let Some(entry) = self.registry.lookup(handle) else {
            return;
        };
        let status = entry.file.continue_write();
        match status {
            Ok(WriteStatus::Done) => {
                if let Err(e) = self.registry.set_wants_writable(handle, false) {
                    warn!("proxy: failed to disarm write watch for handle {handle}: {e}");
                }
            }
            Ok(WriteStatus::Pending) => {}
            Err(e) => {
                warn!("proxy: resumed write to handle {handle} failed: {e}");
                self.handle_local_file_error(handle);
            }
        }
    }

    /// EOF or an unrecoverable error on a local fd: drop the entry and tell
    /// the peer. Applied identically on both sides.
    fn handle_local_file_error(&mut self, handle: i64) {
        self.registry.erase(handle);
        self.send_message(&VsockMessage::Close { handle }, &[]);
    }

    // ---- Public surface --------------------------------------------------

    /// Registers `fd` under `handle` (0 allocates a fresh one). Returns the
    /// handle, or 0 on failure.
    pub fn register_file_descriptor(&mut self, fd: OwnedFd, kind: FdKind, handle: i64) -> i64 {
        if self.stopped {
            return 0;
        }
        self.registry.register(fd, kind, handle)
    }

    /// Asks the peer to connect(2) to a unix domain socket at `path`. The
    /// callback receives `(errno, handle)`.
    pub fn connect(&mut self, path: &Path, callback: ConnectCallback) {
        if self.stopped {
            callback(libc::ECONNRESET, 0);
            return;
        }
        let cookie = self.generate_cookie();
        self.pending_connect.insert(cookie, callback);
        self.send_message(
            &VsockMessage::ConnectRequest {
                cookie,
                path: path.as_os_str().as_bytes().to_vec(),
            },
            &[],
        );
    }

    /// Asks the peer to pread(2) the file behind `handle`.
    pub fn pread(&mut self, handle: i64, count: u64, offset: u64, callback: PreadCallback) {
        if self.stopped {
            callback(libc::ECONNRESET, Vec::new());
            return;
        }
        let cookie = self.generate_cookie();
        self.pending_pread.insert(cookie, callback);
        self.send_message(
            &VsockMessage::PreadRequest {
                cookie,
                handle,
                count,
                offset,
            },
            &[],
        );
    }

    /// Asks the peer to pwrite(2) the file behind `handle`.
    pub fn pwrite(&mut self, handle: i64, blob: Vec<u8>, offset: u64, callback: PwriteCallback) {
        if self.stopped {
            callback(libc::ECONNRESET, 0);
            return;
        }
        let cookie = self.generate_cookie();
        self.pending_pwrite.insert(cookie, callback);
        self.send_message(
            &VsockMessage::PwriteRequest {
                cookie,
                handle,
                blob,
                offset,
            },
            &[],
        );
    }

    /// Asks the peer for the current size of the file behind `handle`.
    pub fn fstat(&mut self, handle: i64, callback: FstatCallback) {
        if self.stopped {
            callback(libc::ECONNRESET, 0);
            return;
        }
        let cookie = self.generate_cookie();
        self.pending_fstat.insert(cookie, callback);
        self.send_message(&VsockMessage::FstatRequest { cookie, handle }, &[]);
    }

    /// Releases `handle` on both sides. Fire-and-forget.
    pub fn close(&mut self, handle: i64) {
        if self.stopped {
            return;
        }
        self.registry.erase(handle);
        self.send_message(&VsockMessage::Close { handle }, &[]);
    }

    /// Stops the proxy: fails every pending call with a transport-closed
    /// errno, closes every registered fd and fires the delegate's stop hook.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("proxy: {:?} stopping", self.side);
        self.shared.queue.lock().unwrap().stopped = true;
        // Tasks already queued still run, against a stopped proxy, so their
        // callers get an immediate transport-closed answer.
        self.run_posted_tasks();
        for callback in self.pending_connect.drain() {
            callback(libc::ECONNRESET, 0);
        }
        for callback in self.pending_pread.drain() {
            callback(libc::ECONNRESET, Vec::new());
        }
        for callback in self.pending_pwrite.drain() {
            callback(libc::ECONNRESET, 0);
        }
        for callback in self.pending_fstat.drain() {
            callback(libc::ECONNRESET, 0);
        }
        self.registry.clear();
        self.delegate.on_stopped();
    }

    fn generate_cookie(&mut self) -> i64 {
        let cookie = self.next_cookie;
        self.next_cookie += self.cookie_step;
        cookie
    }

    /// Writes one message to the peer. Any transport failure is terminal and
    /// stops the proxy.
    fn send_message(&mut self, message: &VsockMessage, fds: &[RawFd]) {
        if self.stopped {
            return;
        }
        if self.side == Side::Server && !fds.is_empty() {
            error!("proxy: {}", Error::FdPassingDisallowed);
            self.stop();
            return;
        }
        if let Err(e) = self.stream.write_message(message, fds) {
            error!("proxy: failed to write message: {e}");
            self.stop();
        }
    }
}

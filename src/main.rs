// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Daemon entry point.
//!
//! Runs one side of the fd-extending message proxy over a unix domain
//! transport. The server side binds the transport socket and waits for its
//! peer; the client side connects to it. With `--mount`, remote regular-file
//! handles become openable files under the given directory.

mod fd_registry;
mod file_util;
mod local_file;
mod message_stream;
mod pending;
mod protocol;
mod proxy_fs;
mod vsock_proxy;

use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::prelude::OwnedFd;
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};

use crate::proxy_fs::ProxyFsMount;
use crate::vsock_proxy::{Error, ProxyDelegate, Result, Side, VsockProxy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum SideArg {
    /// Host side: binds the transport socket and allocates positive handles.
    Server,
    /// Guest side: connects to the transport socket.
    Client,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Bidirectional fd-extending message proxy")]
struct ProxyArgs {
    /// Which side of the proxy pair to run.
    #[arg(long)]
    side: SideArg,

    /// Path of the unix domain socket used as the peer transport.
    #[arg(long)]
    socket: PathBuf,

    /// Directory to mount the proxy filesystem on. Without it, regular-file
    /// handles received from the peer are rejected.
    #[arg(long)]
    mount: Option<PathBuf>,
}

/// Wires the proxy filesystem into the proxy core. The mount slot is filled
/// after the proxy exists, since the filesystem needs a proxy handle.
struct DaemonDelegate {
    mount: Arc<Mutex<Option<ProxyFsMount>>>,
}

impl ProxyDelegate for DaemonDelegate {
    fn create_proxied_regular_file(
        &mut self,
        handle: i64,
        flags: i32,
    ) -> std::io::Result<OwnedFd> {
        match self.mount.lock().unwrap().as_ref() {
            Some(mount) => mount.register_handle(handle, flags),
            None => Err(std::io::Error::from_raw_os_error(libc::ENOSYS)),
        }
    }

    fn on_stopped(&mut self) {
        info!("proxy: stopped");
    }
}

fn connect_transport(side: Side, socket: &PathBuf) -> Result<UnixStream> {
    match side {
        Side::Server => {
            // A stale socket from a previous run would fail the bind.
            let _ = std::fs::remove_file(socket);
            let listener = UnixListener::bind(socket).map_err(Error::UnixBind)?;
            info!("proxy: waiting for peer on {}", socket.display());
            let (transport, _) = listener.accept().map_err(Error::UnixAccept)?;
            Ok(transport)
        }
        Side::Client => UnixStream::connect(socket).map_err(Error::UnixConnect),
    }
}

fn run(args: ProxyArgs) -> Result<()> {
    let side = match args.side {
        SideArg::Server => Side::Server,
        SideArg::Client => Side::Client,
    };
    let transport = connect_transport(side, &args.socket)?;

    let mount_slot = Arc::new(Mutex::new(None));
    let delegate = Box::new(DaemonDelegate {
        mount: mount_slot.clone(),
    });
    let mut proxy = VsockProxy::new(side, transport, delegate)?;

    if let Some(dir) = &args.mount {
        let mount = ProxyFsMount::mount(dir, proxy.handle()).map_err(Error::FuseMount)?;
        *mount_slot.lock().unwrap() = Some(mount);
    }

    proxy.run();
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run(ProxyArgs::parse()) {
        error!("proxy: {e}");
        exit(1);
    }
}

//! Local control channel to the debugging agent
//!
//! A `SOCK_SEQPACKET` pair created before the worker starts. The broker
//! reads status records from the local end; the remote end's descriptor
//! number is passed to the agent in its argument string, and the agent
//! later receives the live connection over it.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

use adblink_protocol::control::{AgentMessage, HandshakeMode, MAX_CONTROL_MESSAGE};

use crate::fd_lock::FdLock;
use crate::sys;

/// Both ends of the control socket pair, before registration with a reactor
#[derive(Debug)]
pub struct ControlPair {
    local: OwnedFd,
    remote: OwnedFd,
}

impl ControlPair {
    pub fn create() -> io::Result<Self> {
        let (local, remote) = sys::seqpacket_pair()?;
        debug!(
            local = local.as_raw_fd(),
            remote = remote.as_raw_fd(),
            "Control socket pair created"
        );
        Ok(Self { local, remote })
    }

    /// Descriptor number the agent is told to use
    pub fn remote_fd(&self) -> RawFd {
        self.remote.as_raw_fd()
    }
}

/// The descriptors handed to the agent with one connection
#[derive(Debug)]
pub struct Handoff {
    pub read: OwnedFd,
    pub write: OwnedFd,
    pub write_lock: OwnedFd,
}

impl Handoff {
    /// Fresh duplicates of the live socket and the write lock; the
    /// broker keeps its own descriptors
    pub fn duplicate(socket: RawFd, write_lock: &FdLock) -> io::Result<Self> {
        Ok(Self {
            read: sys::dup_cloexec(socket)?,
            write: sys::dup_cloexec(socket)?,
            write_lock: write_lock.duplicate()?,
        })
    }
}

/// Control channel registered with the worker's reactor
///
/// Must be created from inside the worker's runtime.
#[derive(Debug)]
pub struct ControlChannel {
    local: AsyncFd<OwnedFd>,
    remote: OwnedFd,
}

impl ControlChannel {
    pub fn new(pair: ControlPair) -> io::Result<Self> {
        Ok(Self {
            local: AsyncFd::new(pair.local)?,
            remote: pair.remote,
        })
    }

    pub fn remote_fd(&self) -> RawFd {
        self.remote.as_raw_fd()
    }

    /// Wait for the next status record from the agent
    ///
    /// Cancel safe.
    pub async fn recv(&self) -> io::Result<AgentMessage> {
        let mut buf = [0u8; MAX_CONTROL_MESSAGE + 1];
        loop {
            let mut guard = self.local.readable().await?;
            match guard.try_io(|inner| sys::recv_dontwait(inner.as_raw_fd(), &mut buf)) {
                Ok(result) => {
                    let n = result?;
                    trace!(bytes = n, "Control record received");
                    return Ok(AgentMessage::parse(&buf[..n]));
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Hand the connection to the agent as one end-of-record message
    ///
    /// The descriptors in `handoff` are duplicates; they are closed here
    /// once the kernel has taken its own references.
    pub fn send_fds(&self, mode: HandshakeMode, handoff: Handoff) -> io::Result<()> {
        let fds = [
            handoff.read.as_raw_fd(),
            handoff.write.as_raw_fd(),
            handoff.write_lock.as_raw_fd(),
        ];
        sys::send_with_fds(self.local.get_ref().as_raw_fd(), mode.wire(), &fds)?;
        debug!(instruction = mode.token(), "Connection descriptors sent to agent");
        Ok(())
    }
}

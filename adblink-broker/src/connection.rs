//! The live debugger socket, shared between the worker and DDM publishers
//!
//! The worker installs and closes the socket; any thread may write a DDM
//! packet to it. Every change to the slot and every write happen under the
//! slot mutex and then the [`FdLock`], in that order, so a writer either
//! sees the socket gone or finishes before it can be closed. The agent
//! holds a duplicate of the same lock while it writes.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use adblink_protocol::{encode_ddm_header, fourcc, DdmPacket};

use crate::fd_lock::FdLock;

#[derive(Debug, Default)]
struct LiveSlot {
    socket: Option<Arc<OwnedFd>>,
    /// Socket present and handshake completed by someone
    writable: bool,
}

/// Outcome of a [`SharedConnection::send_packet`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No connected peer that finished the handshake
    Dropped,
    /// Fewer bytes than the packet were written
    Short { written: usize, expected: usize },
}

/// Live socket slot plus the write lock guarding it
#[derive(Debug)]
pub struct SharedConnection {
    slot: Mutex<LiveSlot>,
    write_lock: FdLock,
}

impl SharedConnection {
    pub fn new(write_lock: FdLock) -> Self {
        Self {
            slot: Mutex::new(LiveSlot::default()),
            write_lock,
        }
    }

    pub fn write_lock(&self) -> &FdLock {
        &self.write_lock
    }

    /// Install a freshly forwarded socket; never writable until a handshake
    pub fn install(&self, socket: Arc<OwnedFd>) -> io::Result<()> {
        let mut slot = self.slot.lock();
        let _guard = self.write_lock.acquire()?;
        slot.socket = Some(socket);
        slot.writable = false;
        Ok(())
    }

    /// Drop the slot's reference to the socket
    pub fn close(&self) -> io::Result<()> {
        let mut slot = self.slot.lock();
        let _guard = self.write_lock.acquire()?;
        slot.socket = None;
        slot.writable = false;
        Ok(())
    }

    /// Mirror the state machine's view of whether DDM output may flow
    pub fn set_writable(&self, writable: bool) {
        let mut slot = self.slot.lock();
        slot.writable = writable && slot.socket.is_some();
    }

    pub fn is_writable(&self) -> bool {
        self.slot.lock().writable
    }

    /// Write one DDM packet as a single gathered write
    ///
    /// Best effort: nothing is retried and protocol state never changes.
    pub fn send_packet(&self, packet: &DdmPacket) -> io::Result<SendOutcome> {
        let slot = self.slot.lock();
        let _guard = self.write_lock.acquire()?;

        let socket = match (&slot.socket, slot.writable) {
            (Some(socket), true) => socket,
            _ => {
                trace!(
                    chunk = %fourcc(packet.chunk_type),
                    "Not sending DDM packet: no debugger"
                );
                return Ok(SendOutcome::Dropped);
            }
        };

        let header = encode_ddm_header(
            packet.id,
            packet.kind,
            packet.chunk_type,
            packet.payload.len(),
        );
        let expected = header.len() + packet.payload.len();
        let written = match crate::sys::send_vectored(
            socket.as_raw_fd(),
            &[&header[..], &packet.payload[..]],
        ) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    chunk = %fourcc(packet.chunk_type),
                    error = %e,
                    "Failed to send DDM packet to debugger"
                );
                return Ok(SendOutcome::Short {
                    written: 0,
                    expected,
                });
            }
        };

        if written != expected {
            warn!(
                chunk = %fourcc(packet.chunk_type),
                written,
                expected,
                "Short write of DDM packet to debugger"
            );
            return Ok(SendOutcome::Short { written, expected });
        }

        trace!(chunk = %fourcc(packet.chunk_type), bytes = written, "Sent DDM packet");
        Ok(SendOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adblink_protocol::{build_packet, PacketKind};
    use bytes::Bytes;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn packet(id: u32) -> DdmPacket {
        DdmPacket {
            id,
            kind: PacketKind::Command,
            chunk_type: 0x4150_4e4d,
            payload: Bytes::from_static(b"data"),
        }
    }

    fn connected() -> (SharedConnection, UnixStream) {
        let shared = SharedConnection::new(FdLock::new().unwrap());
        let (ours, theirs) = UnixStream::pair().unwrap();
        shared.install(Arc::new(OwnedFd::from(ours))).unwrap();
        (shared, theirs)
    }

    #[test]
    fn test_dropped_without_socket() {
        let shared = SharedConnection::new(FdLock::new().unwrap());
        assert_eq!(shared.send_packet(&packet(1)).unwrap(), SendOutcome::Dropped);
        shared.set_writable(true);
        assert!(!shared.is_writable());
    }

    #[test]
    fn test_dropped_before_handshake() {
        let (shared, mut peer) = connected();
        assert_eq!(shared.send_packet(&packet(1)).unwrap(), SendOutcome::Dropped);

        peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 1];
        assert!(peer.read(&mut buf).is_err());
    }

    #[test]
    fn test_sent_bytes_match_built_packet() {
        let (shared, mut peer) = connected();
        shared.set_writable(true);
        assert_eq!(shared.send_packet(&packet(0x8000_0001)).unwrap(), SendOutcome::Sent);

        let expected = build_packet(0x8000_0001, PacketKind::Command, 0x4150_4e4d, b"data");
        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got[..], &expected[..]);
    }

    #[test]
    fn test_close_resets_writable() {
        let (shared, _peer) = connected();
        shared.set_writable(true);
        shared.close().unwrap();
        assert!(!shared.is_writable());
        assert_eq!(shared.send_packet(&packet(1)).unwrap(), SendOutcome::Dropped);
    }

    #[test]
    fn test_concurrent_close_never_races_a_write() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let shared = Arc::new(SharedConnection::new(FdLock::new().unwrap()));
        let done = Arc::new(AtomicBool::new(false));

        let publisher = {
            let shared = Arc::clone(&shared);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut outcomes = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    outcomes.push(shared.send_packet(&packet(1)).unwrap());
                }
                outcomes
            })
        };

        for _ in 0..200 {
            let (ours, theirs) = UnixStream::pair().unwrap();
            shared.install(Arc::new(OwnedFd::from(ours))).unwrap();
            shared.set_writable(true);
            std::thread::yield_now();
            shared.close().unwrap();
            // Peer outlives the close, so any failed write was on a stale descriptor
            drop(theirs);
        }
        done.store(true, Ordering::SeqCst);

        let outcomes = publisher.join().unwrap();
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SendOutcome::Sent | SendOutcome::Dropped)));
    }

    #[test]
    fn test_write_to_vanished_peer_is_logged_not_fatal() {
        let (shared, peer) = connected();
        shared.set_writable(true);
        drop(peer);
        assert!(matches!(
            shared.send_packet(&packet(1)).unwrap(),
            SendOutcome::Short { written: 0, .. }
        ));
    }
}

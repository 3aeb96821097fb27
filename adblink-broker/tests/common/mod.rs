//! Fake collaborators for driving a real broker worker

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use adblink_broker::config::{BrokerConfig, RetryConfig};
use adblink_broker::sys;
use adblink_broker::{
    AgentAttacher, BridgeClient, BridgeConnector, Collaborators, DdmHandler, DdmReply, ProcessInfo,
};
use adblink_protocol::{DdmPacket, JdwpCodec, Packet, PacketKind, PACKET_HEADER_LEN};
use adblink_utils::{AdblinkError, Result};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or the wait limit passes
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.process.debuggable = true;
    config.process.package_name = Some("com.example.app".into());
    config.retry = RetryConfig {
        initial_delay_ms: 10,
        max_delay_ms: 20,
    };
    config
}

/// Bridge daemon stand-in; each registration is a seqpacket pair
#[derive(Default)]
pub struct FakeBridge {
    daemon: Mutex<Option<OwnedFd>>,
    pub connects: AtomicUsize,
    pub registrations: AtomicUsize,
    failures_left: AtomicUsize,
    pub last_info: Mutex<Option<ProcessInfo>>,
}

impl FakeBridge {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn is_registered(&self) -> bool {
        self.daemon.lock().is_some()
    }

    /// Forward a new debugger connection; returns the debugger's end
    pub fn forward_debugger(&self) -> UnixStream {
        let (debugger, broker_side) = UnixStream::pair().unwrap();
        self.forward_fd(broker_side.as_raw_fd());
        debugger
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        debugger
    }

    pub fn forward_fd(&self, fd: RawFd) {
        let daemon = self.daemon.lock();
        let daemon = daemon.as_ref().expect("not registered");
        sys::send_with_fds(daemon.as_raw_fd(), b"fwd", &[fd]).unwrap();
    }

    /// Make the registration readable without forwarding anything
    pub fn poke(&self) {
        let daemon = self.daemon.lock();
        let daemon = daemon.as_ref().expect("not registered");
        sys::send(daemon.as_raw_fd(), b"restart").unwrap();
    }
}

impl BridgeConnector for FakeBridge {
    fn connect(&self, info: &ProcessInfo) -> Result<Box<dyn BridgeClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_info.lock() = Some(info.clone());
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AdblinkError::bridge("no daemon"));
        }

        let (daemon, client) = sys::seqpacket_pair()?;
        *self.daemon.lock() = Some(daemon);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeClient { fd: client }))
    }
}

struct FakeClient {
    fd: OwnedFd,
}

impl BridgeClient for FakeClient {
    fn pollable_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn receive_forwarded_fd(&mut self) -> io::Result<OwnedFd> {
        let mut byte = [0u8; 1];
        if sys::peek(self.fd.as_raw_fd(), &mut byte)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "daemon gone"));
        }
        let mut buf = [0u8; 16];
        let (_, mut fds) = sys::recv_with_fds(self.fd.as_raw_fd(), &mut buf, 1)?;
        fds.pop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no descriptor"))
    }
}

/// Records attach requests; optionally fails the first few
#[derive(Default)]
pub struct FakeAttacher {
    pub calls: Mutex<Vec<String>>,
    failures_left: AtomicUsize,
}

impl FakeAttacher {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Control descriptor the agent was told to use
    pub fn control_fd(&self) -> RawFd {
        let calls = self.calls.lock();
        let args = calls.last().expect("agent never attached");
        args.split(',')
            .find_map(|kv| kv.strip_prefix("address="))
            .expect("no address")
            .parse()
            .unwrap()
    }
}

impl AgentAttacher for FakeAttacher {
    fn attach(&self, args: &str) -> Result<()> {
        self.calls.lock().push(args.to_string());
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AdblinkError::agent_attach("libjdwp.so", "dlopen failed"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdmEvent {
    Connected,
    Disconnected,
    Chunk(u32, Vec<u8>),
}

/// Records DDM traffic and answers with a fixed reply if configured
#[derive(Default)]
pub struct RecordingDdm {
    pub events: Mutex<Vec<DdmEvent>>,
    pub reply: Option<DdmReply>,
}

impl RecordingDdm {
    pub fn replying(reply: DdmReply) -> Self {
        Self {
            reply: Some(reply),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<DdmEvent> {
        self.events.lock().clone()
    }
}

impl DdmHandler for RecordingDdm {
    fn connected(&self) {
        self.events.lock().push(DdmEvent::Connected);
    }

    fn disconnected(&self) {
        self.events.lock().push(DdmEvent::Disconnected);
    }

    fn handle_chunk(&self, chunk_type: u32, payload: &[u8]) -> Option<DdmReply> {
        self.events
            .lock()
            .push(DdmEvent::Chunk(chunk_type, payload.to_vec()));
        self.reply.clone()
    }
}

pub struct Harness {
    pub bridge: Arc<FakeBridge>,
    pub attacher: Arc<FakeAttacher>,
    pub ddm: Arc<RecordingDdm>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeBridge::default(), FakeAttacher::default(), RecordingDdm::default())
    }

    pub fn with(bridge: FakeBridge, attacher: FakeAttacher, ddm: RecordingDdm) -> Self {
        Self {
            bridge: Arc::new(bridge),
            attacher: Arc::new(attacher),
            ddm: Arc::new(ddm),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            connector: self.bridge.clone(),
            attacher: self.attacher.clone(),
            ddm: self.ddm.clone(),
        }
    }
}

/// Perform the debugger side of the handshake
pub fn handshake(debugger: &mut UnixStream) {
    debugger.write_all(b"JDWP-Handshake").unwrap();
    let mut echo = [0u8; 14];
    debugger.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"JDWP-Handshake");
}

/// True when nothing arrives within the stream's read timeout
pub fn nothing_to_read(debugger: &mut UnixStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        debugger.read(&mut buf),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
    )
}

/// Read exactly one JDWP packet off the debugger's end
pub fn read_packet(debugger: &mut UnixStream) -> Packet {
    let mut codec = JdwpCodec::new();
    let mut buf = BytesMut::zeroed(PACKET_HEADER_LEN);
    debugger.read_exact(&mut buf).unwrap();
    loop {
        if let Some(packet) = codec.decode(&mut buf).unwrap() {
            return packet;
        }
        let mut byte = [0u8; 1];
        debugger.read_exact(&mut byte).unwrap();
        buf.put_u8(byte[0]);
    }
}

/// Send a DDM chunk command from the debugger side
pub fn send_ddm(debugger: &mut UnixStream, id: u32, chunk_type: u32, payload: &[u8]) {
    let mut buf = BytesMut::new();
    JdwpCodec::new()
        .encode(
            DdmPacket {
                id,
                kind: PacketKind::Command,
                chunk_type,
                payload: Bytes::copy_from_slice(payload),
            },
            &mut buf,
        )
        .unwrap();
    debugger.write_all(&buf).unwrap();
}

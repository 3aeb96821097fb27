//! The worker's event loop
//!
//! One current-thread tokio runtime on a dedicated OS thread waits on four
//! sources: cancellation, the agent control channel, the bridge
//! registration, and the live debugger socket. When several are ready at
//! once they are taken in that order. Each event becomes an [`Input`] for
//! the state machine, and the returned [`Action`]s are carried out here.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use adblink_protocol::control::HandshakeMode;
use adblink_protocol::{
    fourcc, is_ddm_chunk, matches_handshake, parse_header, split_ddm_chunk, AgentMessage,
    DdmPacket, PacketKind, HANDSHAKE, PACKET_HEADER_LEN,
};

use crate::agent::AgentLaunch;
use crate::bridge::{connect_with_backoff, BridgeClient, ProcessInfo};
use crate::broker::Collaborators;
use crate::config::RetryConfig;
use crate::connection::SharedConnection;
use crate::control::{ControlChannel, ControlPair, Handoff};
use crate::state::{Action, Input, LiveWatch, Machine};
use crate::sys;

/// Everything the worker thread needs, moved in at spawn
pub(crate) struct WorkerContext {
    pub shared: Arc<SharedConnection>,
    pub collaborators: Collaborators,
    pub process: ProcessInfo,
    pub launch: AgentLaunch,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
    pub control: ControlPair,
}

/// Thread entry point: build the runtime and run until cancelled
pub(crate) fn run_worker(ctx: WorkerContext) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build worker runtime; debugging disabled");
            return;
        }
    };

    runtime.block_on(async move {
        match EventLoop::new(ctx) {
            Ok(event_loop) => event_loop.run().await,
            Err(e) => error!(error = %e, "Failed to register control channel; debugging disabled"),
        }
    });
}

/// Bridge descriptor watched on behalf of the opaque client
struct BridgeFd(RawFd);

impl AsRawFd for BridgeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Registration {
    // Declared first so it deregisters before the client closes the descriptor
    watch: AsyncFd<BridgeFd>,
    client: Box<dyn BridgeClient>,
}

enum Event {
    Shutdown,
    Control(io::Result<AgentMessage>),
    Forwarded(io::Result<OwnedFd>),
    /// Profileable-only processes never take connections: readiness means
    /// the daemon restarted
    BridgeRestarted,
    Live(io::Result<LiveEvent>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveEvent {
    Data,
    Hangup,
}

struct EventLoop {
    machine: Machine,
    shared: Arc<SharedConnection>,
    collaborators: Collaborators,
    process: ProcessInfo,
    launch: AgentLaunch,
    retry: RetryConfig,
    cancel: CancellationToken,
    control: ControlChannel,
    registration: Option<Registration>,
    live: Option<AsyncFd<Arc<OwnedFd>>>,
    /// Set after a failed attach so only new data triggers another attempt
    discard_live_ready: bool,
}

impl EventLoop {
    fn new(ctx: WorkerContext) -> io::Result<Self> {
        Ok(Self {
            machine: Machine::new(),
            shared: ctx.shared,
            collaborators: ctx.collaborators,
            process: ctx.process,
            launch: ctx.launch,
            retry: ctx.retry,
            cancel: ctx.cancel,
            control: ControlChannel::new(ctx.control)?,
            registration: None,
            live: None,
            discard_live_ready: false,
        })
    }

    async fn run(mut self) {
        info!(
            pid = self.process.pid,
            debuggable = self.process.debuggable,
            profileable = self.process.profileable,
            "Debugger worker started"
        );

        loop {
            if self.registration.is_none() {
                if !self.register().await {
                    break;
                }
                continue;
            }

            let debuggable = self.process.debuggable;
            let event = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => Event::Shutdown,

                msg = self.control.recv(), if self.machine.control_armed() => {
                    Event::Control(msg)
                }

                event = registration_event(self.registration.as_mut(), debuggable),
                    if self.machine.registration_armed() => event,

                event = live_event(
                    self.live.as_ref(),
                    self.machine.live_watch(),
                    &mut self.discard_live_ready,
                ), if self.machine.live_armed() => Event::Live(event),
            };

            match event {
                Event::Shutdown => break,
                Event::Control(Ok(message)) => {
                    debug!(message = message.token(), "Agent control message");
                    if let AgentMessage::Unknown(ref token) = message {
                        error!(token = %token, "Unknown message received from agent");
                    }
                    self.apply(Input::Agent(message));
                }
                Event::Control(Err(e)) => {
                    error!(error = %e, "Failed to read from agent control socket");
                }
                Event::Forwarded(Ok(fd)) => self.on_forwarded(fd),
                Event::Forwarded(Err(e)) => {
                    warn!(error = %e, "Bridge registration lost; reconnecting");
                    self.drop_registration();
                }
                Event::BridgeRestarted => {
                    debug!("Bridge daemon restarted; re-registering");
                    self.drop_registration();
                }
                Event::Live(Ok(LiveEvent::Data)) => self.apply(Input::LiveData),
                Event::Live(Ok(LiveEvent::Hangup)) => {
                    debug!("Debugger hung up");
                    self.apply(Input::LiveHangup);
                }
                Event::Live(Err(e)) => {
                    error!(error = %e, "Failed to poll debugger socket");
                    self.apply(Input::ConnectionBroken);
                }
            }
        }

        self.shutdown();
    }

    /// Connect to the bridge; false when cancelled or the reactor failed
    async fn register(&mut self) -> bool {
        let Some(client) = connect_with_backoff(
            self.collaborators.connector.as_ref(),
            &self.process,
            &self.retry,
            &self.cancel,
        )
        .await
        else {
            return false;
        };

        match AsyncFd::new(BridgeFd(client.pollable_fd())) {
            Ok(watch) => {
                self.registration = Some(Registration { watch, client });
                self.apply(Input::Registered);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to watch bridge descriptor; debugging disabled");
                false
            }
        }
    }

    fn drop_registration(&mut self) {
        self.registration = None;
        self.apply(Input::RegistrationLost);
    }

    fn on_forwarded(&mut self, fd: OwnedFd) {
        let raw = fd.as_raw_fd();
        let mut pending: VecDeque<Action> = self.machine.step(Input::DebuggerConnected).into();
        if pending.contains(&Action::DropNewSocket) {
            debug!(fd = raw, "Ignoring second debugger: accept then drop");
            return;
        }

        let socket = Arc::new(fd);
        let installed = AsyncFd::new(Arc::clone(&socket))
            .and_then(|watch| self.shared.install(socket).map(|_| watch));
        match installed {
            Ok(watch) => {
                info!(fd = raw, "Debugger connection established");
                self.live = Some(watch);
                self.discard_live_ready = false;
            }
            Err(e) => {
                error!(error = %e, "Failed to take debugger connection");
                pending = self.machine.step(Input::ConnectionBroken).into();
            }
        }

        self.drain(pending);
    }

    /// Feed one input through the machine and carry out the consequences
    fn apply(&mut self, input: Input) {
        trace!(?input, link = ?self.machine.link(), "State input");
        let pending: VecDeque<Action> = self.machine.step(input).into();
        self.drain(pending);
    }

    fn drain(&mut self, mut pending: VecDeque<Action>) {
        while let Some(action) = pending.pop_front() {
            if let Some(next) = self.perform(action) {
                trace!(input = ?next, "Follow-up input");
                pending.extend(self.machine.step(next));
            }
        }
        self.shared.set_writable(self.machine.writable());
    }

    fn perform(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::PerformHandshake => Some(self.perform_handshake()),
            Action::ServeDdm => self.serve_ddm(),
            Action::AttachAgent => Some(self.attach_agent()),
            Action::SendFds { require_handshake } => self.send_fds(require_handshake),
            Action::CloseSocket => {
                self.close_socket();
                None
            }
            Action::DropNewSocket => None,
            Action::NotifyDdm(active) => {
                debug!(active, "DDM connection state changed");
                if active {
                    self.collaborators.ddm.connected();
                } else {
                    self.collaborators.ddm.disconnected();
                }
                None
            }
        }
    }

    fn live_fd(&self) -> Option<RawFd> {
        self.live.as_ref().map(|live| live.get_ref().as_raw_fd())
    }

    fn perform_handshake(&mut self) -> Input {
        let Some(fd) = self.live_fd() else {
            return Input::HandshakeRejected;
        };

        match sys::bytes_available(fd) {
            Ok(avail) if avail >= HANDSHAKE.len() => {}
            Ok(avail) => {
                warn!(avail, "Closing connection to broken client");
                return Input::HandshakeRejected;
            }
            Err(e) => {
                error!(error = %e, "Failed to determine readable data for handshake");
                return Input::HandshakeRejected;
            }
        }

        let mut buf = [0u8; HANDSHAKE.len()];
        match sys::recv_dontwait(fd, &mut buf) {
            Ok(n) if n == buf.len() && matches_handshake(&buf) => {}
            Ok(n) => {
                warn!(bytes = n, "Handshake failed");
                return Input::HandshakeRejected;
            }
            Err(e) => {
                error!(error = %e, "Failed to read handshake");
                return Input::HandshakeRejected;
            }
        }

        match sys::send(fd, HANDSHAKE) {
            Ok(n) if n == HANDSHAKE.len() => {
                debug!("Handshake completed");
                Input::HandshakeAccepted
            }
            Ok(n) => {
                error!(bytes = n, "Short handshake response");
                Input::HandshakeRejected
            }
            Err(e) => {
                error!(error = %e, "Failed to send handshake response");
                Input::HandshakeRejected
            }
        }
    }

    /// Answer one DDM packet without the agent, or say why we can't
    ///
    /// Nothing is consumed from the socket unless the whole packet is
    /// already buffered and is a DDM chunk.
    fn serve_ddm(&mut self) -> Option<Input> {
        let fd = self.live_fd()?;

        let mut raw = [0u8; PACKET_HEADER_LEN];
        let peeked = match sys::peek(fd, &mut raw) {
            Ok(0) => return Some(Input::ConnectionBroken),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                error!(error = %e, "Unable to peek into debugger socket; closing");
                return Some(Input::ConnectionBroken);
            }
        };
        if peeked < PACKET_HEADER_LEN {
            warn!(peeked, "Partial packet header; loading agent to handle it");
            return Some(Input::NeedsAgent);
        }

        let header = parse_header(&raw);
        if !is_ddm_chunk(&header) {
            debug!(
                command_set = header.command_set,
                command = header.command,
                "Packet needs the agent"
            );
            return Some(Input::NeedsAgent);
        }

        let total = header.length as usize;
        match sys::bytes_available(fd) {
            Ok(avail) if avail >= total => {}
            Ok(avail) => {
                warn!(
                    expected = total,
                    avail, "Insufficient data for DDM packet; loading agent"
                );
                return Some(Input::NeedsAgent);
            }
            Err(e) => {
                error!(error = %e, "Failed to determine readable data; closing");
                return Some(Input::ConnectionBroken);
            }
        }

        let mut packet = vec![0u8; total];
        match sys::recv_waitall(fd, &mut packet) {
            Ok(n) if n == total => {}
            Ok(n) => {
                error!(read = n, expected = total, "Short read of DDM packet; closing");
                return Some(Input::ConnectionBroken);
            }
            Err(e) => {
                error!(error = %e, "Failed to read DDM packet; closing");
                return Some(Input::ConnectionBroken);
            }
        }

        // Malformed chunks are dropped without a reply
        let Some((sub, payload)) = split_ddm_chunk(&packet[PACKET_HEADER_LEN..]) else {
            debug!(id = header.id, "Ignoring malformed DDM chunk");
            return None;
        };

        for action in self.machine.step(Input::ChunkReceived) {
            self.perform(action);
        }

        trace!(id = header.id, chunk = %fourcc(sub.chunk_type), len = payload.len(), "DDM chunk");
        let reply = self.collaborators.ddm.handle_chunk(sub.chunk_type, payload)?;

        let reply = DdmPacket {
            id: header.id,
            kind: PacketKind::Reply,
            chunk_type: reply.chunk_type,
            payload: Bytes::from(reply.payload),
        };
        if let Err(e) = self.shared.send_packet(&reply) {
            error!(error = %e, "Failed to lock debugger socket for DDM reply");
        }
        None
    }

    fn attach_agent(&mut self) -> Input {
        let args = self
            .launch
            .build_args(self.machine.ddm_active(), self.control.remote_fd());
        info!(agent = %self.launch.agent_name, "Attaching debugging agent");
        debug!(args = %args, "Agent arguments");

        match self.collaborators.attacher.attach(&args) {
            Ok(()) => Input::AgentAttached,
            Err(e) => {
                error!(agent = %self.launch.agent_name, error = %e, "Failed to load agent");
                self.discard_live_ready = true;
                Input::AttachFailed
            }
        }
    }

    fn send_fds(&mut self, require_handshake: bool) -> Option<Input> {
        let fd = self.live_fd()?;
        let mode = HandshakeMode::from_required(require_handshake);

        let sent = Handoff::duplicate(fd, self.shared.write_lock())
            .and_then(|handoff| self.control.send_fds(mode, handoff));
        match sent {
            Ok(()) => Some(Input::FdsDelivered),
            Err(e) => {
                error!(error = %e, "Failed to send connection fds to agent");
                None
            }
        }
    }

    fn close_socket(&mut self) {
        // Deregister before the last reference closes the descriptor
        self.live = None;
        self.discard_live_ready = false;
        match self.shared.close() {
            Ok(()) => debug!("Debugger connection closed"),
            Err(e) => error!(error = %e, "Failed to lock debugger socket for close"),
        }
    }

    fn shutdown(&mut self) {
        self.live = None;
        if let Err(e) = self.shared.close() {
            error!(error = %e, "Failed to lock debugger socket during shutdown");
        }
        self.registration = None;
        info!("Debugger worker exiting");
    }
}

async fn registration_event(registration: Option<&mut Registration>, debuggable: bool) -> Event {
    let Some(registration) = registration else {
        return std::future::pending().await;
    };
    loop {
        let mut guard = match registration.watch.readable().await {
            Ok(guard) => guard,
            Err(e) => return Event::Forwarded(Err(e)),
        };
        if !debuggable {
            return Event::BridgeRestarted;
        }
        match guard.try_io(|_| registration.client.receive_forwarded_fd()) {
            Ok(result) => return Event::Forwarded(result),
            Err(_would_block) => continue,
        }
    }
}

/// Wait for the live socket; a hangup wins over buffered data
async fn live_event(
    live: Option<&AsyncFd<Arc<OwnedFd>>>,
    watch: LiveWatch,
    discard_ready: &mut bool,
) -> io::Result<LiveEvent> {
    let Some(live) = live else {
        return std::future::pending().await;
    };
    loop {
        let mut guard = live.ready(Interest::READABLE).await?;
        if guard.ready().is_read_closed() {
            return Ok(LiveEvent::Hangup);
        }
        if watch == LiveWatch::HangupOnly || std::mem::take(discard_ready) {
            guard.clear_ready_matching(Ready::READABLE);
            continue;
        }
        let mut byte = [0u8; 1];
        match guard.try_io(|inner| sys::peek(inner.get_ref().as_raw_fd(), &mut byte)) {
            Ok(Ok(0)) => return Ok(LiveEvent::Hangup),
            Ok(Ok(_)) => return Ok(LiveEvent::Data),
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

//! Connection state machine
//!
//! Pure bookkeeping: [`Machine::step`] takes one observed event and returns
//! the side effects the worker must perform. All I/O happens in the event
//! loop, which feeds the outcome of each effect back in as another input.
//!
//! ```text
//! NoBridge -> WaitingForDebugger -> HandshakePending -> DirectDdm
//!                  ^                      |                 | attach
//!                  |                      v                 v
//!                  +------- close ---- Parked -> FdsSent -> AgentOwned
//! ```
//!
//! The agent's own lifecycle (`NotLoaded`, `Loaded { listening }`) is
//! tracked alongside the link.

use adblink_protocol::AgentMessage;

/// Where the debugger connection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Not registered with the bridge daemon
    NoBridge,
    /// Registered, no debugger connected
    WaitingForDebugger,
    /// Connected, handshake not yet seen; only without an agent
    HandshakePending,
    /// Handshake done, the broker answers DDM itself
    DirectDdm,
    /// Connected while the agent is loaded, descriptors not handed over
    Parked { handshake_done: bool },
    /// Descriptors handed over, agent has not accepted yet
    FdsSent { handshake_done: bool },
    /// The agent accepted the connection
    AgentOwned { handshake_done: bool },
}

impl Link {
    pub fn has_socket(self) -> bool {
        !matches!(self, Link::NoBridge | Link::WaitingForDebugger)
    }

    pub fn handshake_done(self) -> bool {
        match self {
            Link::DirectDdm => true,
            Link::Parked { handshake_done }
            | Link::FdsSent { handshake_done }
            | Link::AgentOwned { handshake_done } => handshake_done,
            _ => false,
        }
    }
}

/// Whether the agent has been loaded, and whether it is listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    NotLoaded,
    Loaded { listening: bool },
}

/// Readiness the worker waits for on the live socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveWatch {
    Off,
    /// Only a peer hangup is of interest; buffered data is left alone
    HangupOnly,
    Data,
}

/// Something the worker observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Registered,
    RegistrationLost,
    /// The bridge forwarded a debugger connection
    DebuggerConnected,
    LiveData,
    LiveHangup,
    HandshakeAccepted,
    HandshakeRejected,
    /// A complete DDM chunk is about to be dispatched
    ChunkReceived,
    /// The pending packet is not one the broker can serve
    NeedsAgent,
    AgentAttached,
    AttachFailed,
    /// A read or write on the live socket failed
    ConnectionBroken,
    FdsDelivered,
    Agent(AgentMessage),
}

/// Side effect requested from the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PerformHandshake,
    ServeDdm,
    AttachAgent,
    SendFds { require_handshake: bool },
    CloseSocket,
    /// A second debugger arrived; accept then drop it
    DropNewSocket,
    NotifyDdm(bool),
}

/// The broker's protocol state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    link: Link,
    agent: AgentStatus,
    ddm_active: bool,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            link: Link::NoBridge,
            agent: AgentStatus::NotLoaded,
            ddm_active: false,
        }
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn agent(&self) -> AgentStatus {
        self.agent
    }

    pub fn ddm_active(&self) -> bool {
        self.ddm_active
    }

    pub fn agent_loaded(&self) -> bool {
        matches!(self.agent, AgentStatus::Loaded { .. })
    }

    pub fn agent_listening(&self) -> bool {
        matches!(self.agent, AgentStatus::Loaded { listening: true })
    }

    /// Whether outgoing DDM packets may be written to the live socket
    pub fn writable(&self) -> bool {
        self.link.has_socket() && self.link.handshake_done()
    }

    /// Watch the bridge descriptor only while no debugger is connected
    pub fn registration_armed(&self) -> bool {
        self.link == Link::WaitingForDebugger
    }

    /// The control channel only carries traffic once the agent exists
    pub fn control_armed(&self) -> bool {
        self.agent_loaded()
    }

    /// How the live socket is watched in the current state
    ///
    /// A parked connection with an idle agent is only watched for hangup;
    /// its data waits for the agent.
    pub fn live_watch(&self) -> LiveWatch {
        match self.link {
            Link::HandshakePending | Link::DirectDdm => LiveWatch::Data,
            Link::Parked { .. } if self.agent_listening() => LiveWatch::Data,
            Link::Parked { .. } => LiveWatch::HangupOnly,
            _ => LiveWatch::Off,
        }
    }

    pub fn live_armed(&self) -> bool {
        self.live_watch() != LiveWatch::Off
    }

    /// Apply one input and return the effects to perform, in order
    pub fn step(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Registered => {
                if self.link == Link::NoBridge {
                    self.link = Link::WaitingForDebugger;
                }
                vec![]
            }
            Input::RegistrationLost => {
                if self.link == Link::WaitingForDebugger {
                    self.link = Link::NoBridge;
                }
                vec![]
            }
            Input::DebuggerConnected => self.on_connected(),
            Input::LiveData => match self.link {
                Link::HandshakePending => vec![Action::PerformHandshake],
                Link::DirectDdm => vec![Action::ServeDdm],
                Link::Parked { handshake_done } if self.agent_listening() => {
                    vec![Action::SendFds {
                        require_handshake: !handshake_done,
                    }]
                }
                _ => vec![],
            },
            Input::LiveHangup => match self.link {
                Link::HandshakePending | Link::DirectDdm | Link::Parked { .. } => self.close(),
                _ => vec![],
            },
            Input::HandshakeAccepted => {
                if self.link == Link::HandshakePending {
                    self.link = Link::DirectDdm;
                }
                vec![]
            }
            Input::HandshakeRejected | Input::ConnectionBroken => self.close(),
            Input::ChunkReceived => {
                if self.ddm_active {
                    vec![]
                } else {
                    self.ddm_active = true;
                    vec![Action::NotifyDdm(true)]
                }
            }
            Input::NeedsAgent => {
                if self.link == Link::DirectDdm && !self.agent_loaded() {
                    vec![Action::AttachAgent]
                } else {
                    vec![]
                }
            }
            Input::AgentAttached => {
                if !self.agent_loaded() {
                    self.agent = AgentStatus::Loaded { listening: false };
                }
                self.link = match self.link {
                    Link::HandshakePending => Link::Parked {
                        handshake_done: false,
                    },
                    Link::DirectDdm => Link::Parked {
                        handshake_done: true,
                    },
                    other => other,
                };
                vec![]
            }
            Input::AttachFailed => vec![],
            Input::FdsDelivered => {
                if let Link::Parked { handshake_done } = self.link {
                    self.link = Link::FdsSent { handshake_done };
                }
                vec![]
            }
            Input::Agent(message) => self.on_agent_message(message),
        }
    }

    fn on_connected(&mut self) -> Vec<Action> {
        if self.link.has_socket() {
            return vec![Action::DropNewSocket];
        }
        match self.agent {
            AgentStatus::NotLoaded => {
                self.link = Link::HandshakePending;
                vec![]
            }
            AgentStatus::Loaded { listening } => {
                self.link = Link::Parked {
                    handshake_done: false,
                };
                // A reconnect after the agent was loaded: it redoes the handshake
                if listening {
                    vec![Action::SendFds {
                        require_handshake: true,
                    }]
                } else {
                    vec![]
                }
            }
        }
    }

    fn on_agent_message(&mut self, message: AgentMessage) -> Vec<Action> {
        if !self.agent_loaded() {
            return vec![];
        }
        match message {
            AgentMessage::ListenStart => {
                self.agent = AgentStatus::Loaded { listening: true };
                match self.link {
                    Link::Parked { handshake_done } => vec![Action::SendFds {
                        require_handshake: !handshake_done,
                    }],
                    _ => vec![],
                }
            }
            AgentMessage::ListenEnd => {
                self.agent = AgentStatus::Loaded { listening: false };
                vec![]
            }
            AgentMessage::Accepted => {
                if self.link.has_socket() {
                    // A fresh session on the agent side: it owns the handshake now
                    self.link = Link::AgentOwned {
                        handshake_done: false,
                    };
                }
                vec![]
            }
            AgentMessage::HandshakeComplete => {
                if let Link::AgentOwned { .. } = self.link {
                    self.link = Link::AgentOwned {
                        handshake_done: true,
                    };
                }
                vec![]
            }
            AgentMessage::Closing => self.close(),
            AgentMessage::Unknown(_) => vec![],
        }
    }

    /// Drop the live socket; a no-op when there is none
    fn close(&mut self) -> Vec<Action> {
        if !self.link.has_socket() {
            return vec![];
        }
        self.link = Link::WaitingForDebugger;
        let mut actions = vec![Action::CloseSocket];
        if !self.agent_loaded() && self.ddm_active {
            self.ddm_active = false;
            actions.push(Action::NotifyDdm(false));
        }
        actions
    }
}

//! Messages exchanged with the debugging agent over the control channel
//!
//! The agent reports its status with short null-terminated ASCII tokens.
//! The broker answers a handoff with one of two instruction tokens sent
//! alongside the duplicated connection descriptors.

/// Agent started listening for a connection
pub const LISTEN_START: &str = "dt_fd_forward:START-LISTEN";
/// Agent stopped listening
pub const LISTEN_END: &str = "dt_fd_forward:END-LISTEN";
/// Agent accepted the handed-off connection
pub const ACCEPTED: &str = "dt_fd_forward:ACCEPTED";
/// Agent closed its connection
pub const CLOSING: &str = "dt_fd_forward:CLOSING";
/// Agent finished the handshake on its side
pub const HANDSHAKE_COMPLETE: &str = "dt_fd_forward:HANDSHAKE-COMPLETE";

/// Instruction: the agent must perform the handshake itself
pub const PERFORM_HANDSHAKE: &str = "HANDSHAKE:REQD";
/// Instruction: the handshake already happened, skip it
pub const SKIP_HANDSHAKE: &str = "HANDSHAKE:SKIP";

/// Upper bound on a single control message, terminator excluded
pub const MAX_CONTROL_MESSAGE: usize = 256;

/// Descriptors in one handoff: read, write, write-lock
pub const FDS_PER_HANDOFF: usize = 3;

/// A status message received from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    ListenStart,
    ListenEnd,
    Accepted,
    Closing,
    HandshakeComplete,
    /// Anything else; logged and ignored by the broker
    Unknown(String),
}

impl AgentMessage {
    /// Parse a raw record, considering only the bytes before the first NUL
    pub fn parse(raw: &[u8]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let token = &raw[..end.min(MAX_CONTROL_MESSAGE)];
        match token {
            t if t == LISTEN_START.as_bytes() => Self::ListenStart,
            t if t == LISTEN_END.as_bytes() => Self::ListenEnd,
            t if t == ACCEPTED.as_bytes() => Self::Accepted,
            t if t == CLOSING.as_bytes() => Self::Closing,
            t if t == HANDSHAKE_COMPLETE.as_bytes() => Self::HandshakeComplete,
            other => Self::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }

    /// The token this message is sent as, without the terminator
    pub fn token(&self) -> &str {
        match self {
            Self::ListenStart => LISTEN_START,
            Self::ListenEnd => LISTEN_END,
            Self::Accepted => ACCEPTED,
            Self::Closing => CLOSING,
            Self::HandshakeComplete => HANDSHAKE_COMPLETE,
            Self::Unknown(s) => s,
        }
    }

    /// Null-terminated wire form, as an agent would send it
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = self.token().as_bytes().to_vec();
        out.push(0);
        out
    }
}

/// Instruction accompanying an fd handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    Perform,
    Skip,
}

impl HandshakeMode {
    pub fn from_required(require_handshake: bool) -> Self {
        if require_handshake {
            Self::Perform
        } else {
            Self::Skip
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Perform => PERFORM_HANDSHAKE,
            Self::Skip => SKIP_HANDSHAKE,
        }
    }

    /// Null-terminated wire form
    pub fn wire(self) -> &'static [u8] {
        match self {
            Self::Perform => b"HANDSHAKE:REQD\0",
            Self::Skip => b"HANDSHAKE:SKIP\0",
        }
    }

    /// Parse a received instruction record (used by agent-side code and tests)
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        match &raw[..end] {
            t if t == PERFORM_HANDSHAKE.as_bytes() => Some(Self::Perform),
            t if t == SKIP_HANDSHAKE.as_bytes() => Some(Self::Skip),
            _ => None,
        }
    }
}

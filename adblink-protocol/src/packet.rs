//! JDWP packet framing for the handshake and DDM chunks
//!
//! Every multi-byte integer on the wire is big-endian. A command packet is
//! an 11-byte header (length, id, flags, command set, command) followed by
//! its body; a reply packet replaces the command set and command bytes with
//! a 16-bit error code. DDM chunks ride inside command set 199 / command 1
//! with an 8-byte sub-header (chunk type, chunk length) before the payload.

use bytes::{BufMut, Bytes, BytesMut};

/// The handshake token, exchanged verbatim in both directions
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

/// Size of a JDWP command/reply header
pub const PACKET_HEADER_LEN: usize = 11;

/// Size of the DDM sub-header (chunk type + chunk length)
pub const DDM_SUBHEADER_LEN: usize = 8;

/// Size of everything that precedes a DDM payload
pub const DDM_HEADER_LEN: usize = PACKET_HEADER_LEN + DDM_SUBHEADER_LEN;

/// Command set carrying DDM chunks (0xc7, 'G' + 128)
pub const DDM_COMMAND_SET: u8 = 199;

/// The single DDM command: "chunk"
pub const DDM_CHUNK_COMMAND: u8 = 1;

/// Flag bit marking a packet as a reply
pub const REPLY_FLAG: u8 = 0x80;

const SIZE_OFFSET: usize = 0;
const ID_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 8;
const COMMAND_SET_OFFSET: usize = 9;
const COMMAND_OFFSET: usize = 10;

/// Decoded JDWP packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet length, header included
    pub length: u32,
    pub id: u32,
    pub flags: u8,
    /// Command set for commands, high byte of the error code for replies
    pub command_set: u8,
    /// Command for commands, low byte of the error code for replies
    pub command: u8,
}

impl PacketHeader {
    /// Whether the reply flag is set
    pub fn is_reply(&self) -> bool {
        self.flags & REPLY_FLAG != 0
    }

    /// Error code of a reply packet
    pub fn error_code(&self) -> u16 {
        u16::from_be_bytes([self.command_set, self.command])
    }

    /// Length of the body following the header, or `None` if the declared
    /// length is shorter than the header itself
    pub fn body_len(&self) -> Option<usize> {
        (self.length as usize).checked_sub(PACKET_HEADER_LEN)
    }
}

/// Parse the fixed 11-byte header
pub fn parse_header(bytes: &[u8; PACKET_HEADER_LEN]) -> PacketHeader {
    PacketHeader {
        length: read_u32(bytes, SIZE_OFFSET),
        id: read_u32(bytes, ID_OFFSET),
        flags: bytes[FLAGS_OFFSET],
        command_set: bytes[COMMAND_SET_OFFSET],
        command: bytes[COMMAND_OFFSET],
    }
}

/// Whether a header announces a DDM chunk command the broker can serve
pub fn is_ddm_chunk(header: &PacketHeader) -> bool {
    header.command_set == DDM_COMMAND_SET
        && header.command == DDM_CHUNK_COMMAND
        && header.length as usize >= PACKET_HEADER_LEN
}

/// DDM chunk sub-header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdmSubheader {
    pub chunk_type: u32,
    /// Declared payload length
    pub length: u32,
}

/// Parse the DDM sub-header at the start of a packet body
///
/// Returns `None` when fewer than 8 bytes are supplied.
pub fn parse_ddm_subheader(body: &[u8]) -> Option<DdmSubheader> {
    if body.len() < DDM_SUBHEADER_LEN {
        return None;
    }
    Some(DdmSubheader {
        chunk_type: read_u32(body, 0),
        length: read_u32(body, 4),
    })
}

/// Split a DDM packet body into its sub-header and payload
///
/// Returns `None` if the body cannot hold the sub-header or the declared
/// payload length overruns the body. Bytes past the declared payload are
/// ignored.
pub fn split_ddm_chunk(body: &[u8]) -> Option<(DdmSubheader, &[u8])> {
    let sub = parse_ddm_subheader(body)?;
    let rest = &body[DDM_SUBHEADER_LEN..];
    let len = sub.length as usize;
    if len > rest.len() {
        return None;
    }
    Some((sub, &rest[..len]))
}

/// Whether a DDM packet is sent unsolicited or answers a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command,
    Reply,
}

impl PacketKind {
    /// Flag byte written at offset 8
    pub fn flags(self) -> u8 {
        match self {
            PacketKind::Command => 0,
            PacketKind::Reply => REPLY_FLAG,
        }
    }

    /// Bytes at offsets 9 and 10: command set + command, or a zero error code
    fn trailer(self) -> [u8; 2] {
        match self {
            PacketKind::Command => [DDM_COMMAND_SET, DDM_CHUNK_COMMAND],
            PacketKind::Reply => [0, 0],
        }
    }
}

/// Encode the 19 bytes preceding a DDM payload of `payload_len` bytes
pub fn encode_ddm_header(
    id: u32,
    kind: PacketKind,
    chunk_type: u32,
    payload_len: usize,
) -> [u8; DDM_HEADER_LEN] {
    let mut out = [0u8; DDM_HEADER_LEN];
    let total = (DDM_HEADER_LEN + payload_len) as u32;
    out[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&total.to_be_bytes());
    out[ID_OFFSET..ID_OFFSET + 4].copy_from_slice(&id.to_be_bytes());
    out[FLAGS_OFFSET] = kind.flags();
    out[COMMAND_SET_OFFSET..=COMMAND_OFFSET].copy_from_slice(&kind.trailer());
    out[PACKET_HEADER_LEN..PACKET_HEADER_LEN + 4].copy_from_slice(&chunk_type.to_be_bytes());
    out[PACKET_HEADER_LEN + 4..].copy_from_slice(&(payload_len as u32).to_be_bytes());
    out
}

/// Build a complete DDM packet
pub fn build_packet(id: u32, kind: PacketKind, chunk_type: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DDM_HEADER_LEN + payload.len());
    buf.put_slice(&encode_ddm_header(id, kind, chunk_type, payload.len()));
    buf.put_slice(payload);
    buf.freeze()
}

/// Exact comparison against the 14-byte handshake token
pub fn matches_handshake(bytes: &[u8]) -> bool {
    bytes == HANDSHAKE
}

/// Render a chunk type as its four-character code (e.g. `HELO`)
pub fn fourcc(chunk_type: u32) -> String {
    chunk_type
        .to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

/// A DDM packet ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdmPacket {
    pub id: u32,
    pub kind: PacketKind,
    pub chunk_type: u32,
    pub payload: Bytes,
}

/// A framed JDWP packet as read from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    /// Sub-header and payload if this is a well-formed DDM chunk command
    pub fn ddm_chunk(&self) -> Option<(DdmSubheader, &[u8])> {
        if self.header.is_reply() || !is_ddm_chunk(&self.header) {
            return None;
        }
        split_ddm_chunk(&self.body)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

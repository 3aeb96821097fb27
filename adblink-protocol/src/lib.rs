//! adblink-protocol: Wire formats spoken by the adblink broker
//!
//! This crate defines the byte-exact formats used on the debugger socket
//! (the JDWP handshake, command/reply packet headers and DDM chunk framing)
//! and the textual messages exchanged with the debugging agent over the
//! local control channel. Nothing here performs I/O.

pub mod codec;
pub mod control;
pub mod packet;

// Re-export main types at crate root
pub use codec::{CodecError, JdwpCodec};
pub use control::{AgentMessage, HandshakeMode};
pub use packet::{
    build_packet, encode_ddm_header, fourcc, is_ddm_chunk, matches_handshake,
    parse_ddm_subheader, parse_header, split_ddm_chunk, DdmPacket, DdmSubheader, Packet,
    PacketHeader, PacketKind, DDM_HEADER_LEN, HANDSHAKE, PACKET_HEADER_LEN,
};

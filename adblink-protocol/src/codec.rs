//! Packet codec for JDWP framing
//!
//! Decodes raw JDWP packets off a byte stream and encodes DDM packets
//! onto one. The broker's live socket is driven with explicit peeks, so
//! this codec is used by callers that own a whole stream (tests, tools).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{encode_ddm_header, parse_header, DdmPacket, Packet, PACKET_HEADER_LEN};

/// Maximum packet size accepted by the decoder (16 MB)
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Packet codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet length: {length}")]
    InvalidLength { length: u32 },

    #[error("Packet too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Codec yielding [`Packet`]s and writing [`DdmPacket`]s
#[derive(Debug, Default)]
pub struct JdwpCodec;

impl JdwpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for JdwpCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; PACKET_HEADER_LEN];
        raw.copy_from_slice(&src[..PACKET_HEADER_LEN]);
        let header = parse_header(&raw);

        let len = header.length as usize;
        if len < PACKET_HEADER_LEN {
            return Err(CodecError::InvalidLength {
                length: header.length,
            });
        }
        if len > MAX_PACKET_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: len,
                max: MAX_PACKET_SIZE,
            });
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        src.advance(PACKET_HEADER_LEN);
        let body = src.split_to(len - PACKET_HEADER_LEN).freeze();
        Ok(Some(Packet { header, body }))
    }
}

impl Encoder<DdmPacket> for JdwpCodec {
    type Error = CodecError;

    fn encode(&mut self, item: DdmPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = crate::packet::DDM_HEADER_LEN + item.payload.len();
        if size > MAX_PACKET_SIZE {
            return Err(CodecError::MessageTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }

        dst.reserve(size);
        dst.put_slice(&encode_ddm_header(
            item.id,
            item.kind,
            item.chunk_type,
            item.payload.len(),
        ));
        dst.put_slice(&item.payload);
        Ok(())
    }
}

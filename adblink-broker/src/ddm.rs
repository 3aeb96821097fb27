//! Runtime-side DDM chunk handling

/// Reply produced by a DDM chunk handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdmReply {
    pub chunk_type: u32,
    pub payload: Vec<u8>,
}

/// Receives DDM traffic served directly by the broker
pub trait DdmHandler: Send + Sync {
    /// A debugger started exchanging DDM chunks
    fn connected(&self);

    /// The DDM connection went away
    fn disconnected(&self);

    /// Handle one chunk; `None` means nothing is sent back
    fn handle_chunk(&self, chunk_type: u32, payload: &[u8]) -> Option<DdmReply>;
}

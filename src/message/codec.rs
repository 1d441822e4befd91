//! JSON wire codec.
//!
//! Payloads are small and human-debuggable, so the envelope goes over the
//! wire as plain JSON, one envelope per datagram.

use crate::error::{MeshError, Result};

use super::MeshMessage;

/// Largest frame we will put in (or accept from) a single UDP datagram.
pub const MAX_DATAGRAM: usize = 65_000;

/// Largest file chunk that still fits the datagram budget once its bytes
/// are hex-encoded and wrapped in the envelope.
pub const MAX_CHUNK_SIZE: u32 = 28 * 1024;

pub fn encode(msg: &MeshMessage) -> Result<Vec<u8>> {
    let frame = serde_json::to_vec(msg)?;
    if frame.len() > MAX_DATAGRAM {
        return Err(MeshError::Oversized {
            size: frame.len(),
            max: MAX_DATAGRAM,
        });
    }
    Ok(frame)
}

pub fn decode(data: &[u8]) -> Result<MeshMessage> {
    Ok(serde_json::from_slice(data)?)
}

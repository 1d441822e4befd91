//! Error taxonomy for the mesh node.
//!
//! Transient network errors are logged at their call sites and never surface
//! through this type; what does surface is the small set of conditions a
//! caller can actually act on (startup failure, bad arguments, dead node).

use std::net::SocketAddr;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode envelope: {0}")]
    Codec(#[from] serde_json::Error),

    /// Every candidate in the port fallback sequence was already bound.
    #[error("no usable port: tried {attempted} candidates starting at {base}")]
    PortsExhausted { base: u16, attempted: usize },

    #[error("node is not running")]
    NotRunning,

    #[error("send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("encoded envelope is {size} bytes, exceeds the datagram budget of {max}")]
    Oversized { size: usize, max: usize },

    #[error("chunk size {0} exceeds the per-datagram chunk budget")]
    ChunkTooLarge(u32),

    #[error("unknown file transfer {0}")]
    UnknownTransfer(Uuid),

    #[error("file transfer {file_id} cannot {action} in its current state")]
    TransferState { file_id: Uuid, action: &'static str },
}

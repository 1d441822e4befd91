//! Wire message envelope and typed payloads.
//!
//! A payload is a tagged union keyed by `msg_type`: one shape per type,
//! decoded explicitly rather than probed by field presence.

pub mod cache;
pub mod codec;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default max hops for messages originated by a node.
pub const DEFAULT_TTL: u8 = 10;

/// Discriminant of a payload, used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    FileInfo,
    FileChunk,
    Discovery,
    Heartbeat,
}

/// Type-dependent message content. Serialized adjacently tagged, so the
/// wire envelope carries `msg_type` and `content` as separate fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "content")]
pub enum Payload {
    #[serde(rename = "TEXT")]
    Text { text: String },

    #[serde(rename = "FILE_INFO")]
    FileInfo {
        file_id: Uuid,
        filename: String,
        size: u64,
        chunk_size: u32,
        total_chunks: u32,
    },

    #[serde(rename = "FILE_CHUNK")]
    FileChunk {
        file_id: Uuid,
        chunk_num: u32,
        total_chunks: u32,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },

    /// Presence beacon: who we are and where unicast messages reach us.
    /// An unspecified `message_ip` (0.0.0.0) means "use the datagram
    /// source address".
    #[serde(rename = "DISCOVERY")]
    Discovery {
        display_name: String,
        message_ip: IpAddr,
        message_port: u16,
    },

    #[serde(rename = "HEARTBEAT")]
    Heartbeat {},
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text { .. } => MessageKind::Text,
            Payload::FileInfo { .. } => MessageKind::FileInfo,
            Payload::FileChunk { .. } => MessageKind::FileChunk,
            Payload::Discovery { .. } => MessageKind::Discovery,
            Payload::Heartbeat {} => MessageKind::Heartbeat,
        }
    }
}

/// The wire envelope. `msg_id` is minted once by the originator and never
/// changes while the message floods through the mesh; only `hop_count`
/// moves, and only when a node forwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub msg_id: Uuid,
    pub sender_id: String,
    /// `None` means broadcast to the whole mesh.
    pub target_id: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
    pub hop_count: u8,
    pub ttl: u8,
    pub timestamp: DateTime<Utc>,
}

impl MeshMessage {
    pub fn new(sender_id: impl Into<String>, payload: Payload, ttl: u8) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            target_id: None,
            payload,
            hop_count: 0,
            ttl,
            timestamp: Utc::now(),
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn ttl_exhausted(&self) -> bool {
        self.hop_count >= self.ttl
    }

    /// Text body, when this is a TEXT message.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text { text } => Some(text),
            _ => None,
        }
    }
}

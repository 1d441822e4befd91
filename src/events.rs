//! Node event bus.
//!
//! The UI layer (or any other observer) subscribes and receives copies;
//! nothing inside the node boundary is shared by reference. Lagging
//! subscribers lose old events rather than backpressuring the node.

use std::net::SocketAddr;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::message::MeshMessage;
use crate::transfer::TransferStatus;

/// Capacity of the broadcast ring; slow observers fall behind past this.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// An application message (TEXT) was delivered to this node.
    MessageReceived(MeshMessage),
    /// A peer transitioned to active: first sighting or back from stale.
    PeerConnected { peer_id: String, addr: SocketAddr },
    /// A peer went stale; fires once per transition.
    PeerDisconnected { peer_id: String },
    /// An incoming file was offered; the application decides accept/reject.
    FileInfoReceived {
        file_id: Uuid,
        sender_id: String,
        filename: String,
        size: u64,
        total_chunks: u32,
    },
    /// A transfer this node participates in changed state.
    TransferUpdated { file_id: Uuid, status: TransferStatus },
}

pub type EventSender = broadcast::Sender<NodeEvent>;
pub type EventReceiver = broadcast::Receiver<NodeEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CAPACITY)
}

//! Flooding relay: dedup, dispatch, decide whether and where to forward.
//!
//! Forwarding keeps the original `msg_id`, so the dedup cache stays
//! effective mesh-wide; a message circling back through a cycle of peers
//! dies at the first node that has already seen it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::Result;
use crate::events::{EventSender, NodeEvent};
use crate::message::cache::MessageCache;
use crate::message::codec;
use crate::message::{MeshMessage, MessageKind, Payload};
use crate::peer::{PeerRecord, PeerTable};
use crate::transport::Transport;

/// Per-type message handler. Errors are logged; one failing handler never
/// stops the others or the relay step.
pub type Handler = Arc<dyn Fn(&MeshMessage) -> anyhow::Result<()> + Send + Sync>;

pub struct RelayEngine {
    node_id: String,
    peers: Arc<PeerTable>,
    cache: Arc<MessageCache>,
    transport: Arc<Transport>,
    handlers: RwLock<HashMap<MessageKind, Vec<Handler>>>,
    events: EventSender,
}

impl RelayEngine {
    pub fn new(
        node_id: String,
        peers: Arc<PeerTable>,
        cache: Arc<MessageCache>,
        transport: Arc<Transport>,
        events: EventSender,
    ) -> Self {
        Self {
            node_id,
            peers,
            cache,
            transport,
            handlers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn register_handler(&self, kind: MessageKind, handler: Handler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Full inbound pipeline for one decoded message: dedup, record,
    /// peer refresh, dispatch, relay decision.
    pub async fn process_inbound(&self, msg: MeshMessage, src: SocketAddr) {
        if !self.cache.check_and_record(msg.msg_id) {
            debug!("duplicate {} dropped", msg.msg_id);
            return;
        }

        if msg.sender_id != self.node_id {
            if self.peers.upsert(&msg.sender_id, src) {
                let _ = self.events.send(NodeEvent::PeerConnected {
                    peer_id: msg.sender_id.clone(),
                    addr: src,
                });
            }
        }

        self.dispatch(&msg);
        self.relay(msg, src).await;
    }

    fn dispatch(&self, msg: &MeshMessage) {
        if matches!(msg.payload, Payload::Text { .. }) {
            let _ = self.events.send(NodeEvent::MessageReceived(msg.clone()));
        }

        let handlers = self
            .handlers
            .read()
            .get(&msg.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if let Err(err) = handler(msg) {
                warn!("handler for {:?} failed on {}: {err:#}", msg.kind(), msg.msg_id);
            }
        }
    }

    async fn relay(&self, mut msg: MeshMessage, arrived_from: SocketAddr) {
        // The originator already sent to its direct peers once.
        if msg.sender_id == self.node_id {
            return;
        }
        // A message addressed to this node is delivered, not forwarded.
        if msg.target_id.as_deref() == Some(self.node_id.as_str()) {
            return;
        }
        if msg.ttl_exhausted() {
            debug!("ttl exhausted for {} at hop {}", msg.msg_id, msg.hop_count);
            return;
        }

        msg.hop_count += 1;
        let targets = relay_targets(&msg, &self.peers.active_peers(), Some(arrived_from));
        self.fan_out(&msg, &targets).await;
    }

    /// Originate a message from this node: remember our own id so an echo
    /// is never re-dispatched, then fan out to the active peers.
    pub async fn send(&self, msg: MeshMessage) -> Result<()> {
        self.cache.record(msg.msg_id);
        let targets = relay_targets(&msg, &self.peers.active_peers(), None);
        if targets.is_empty() {
            debug!("no active peers to carry {}", msg.msg_id);
        }
        // Surface encode failures to the originator; per-peer send failures
        // below stay best-effort.
        let frame = codec::encode(&msg)?;
        self.send_frame(&frame, &targets).await;
        Ok(())
    }

    async fn fan_out(&self, msg: &MeshMessage, targets: &[SocketAddr]) {
        let frame = match codec::encode(msg) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("cannot encode {} for relay: {err}", msg.msg_id);
                return;
            }
        };
        self.send_frame(&frame, targets).await;
    }

    async fn send_frame(&self, frame: &[u8], targets: &[SocketAddr]) {
        for addr in targets {
            if let Err(err) = self.transport.send_to(frame, *addr).await {
                // Transient by classification; the peer will drop out of the
                // active set on its own if it stays unreachable.
                warn!("{err}");
            }
        }
    }
}

/// Where a message goes next. Target shortcut when the target is an active
/// direct peer; otherwise flood to every active peer except the one the
/// message just arrived from (sender-only exclusion: cheap, loop-safe via
/// the dedup cache, at the cost of some redundant re-delivery traffic).
pub fn relay_targets(
    msg: &MeshMessage,
    active: &[PeerRecord],
    arrived_from: Option<SocketAddr>,
) -> Vec<SocketAddr> {
    if let Some(target_id) = &msg.target_id {
        if let Some(record) = active.iter().find(|peer| &peer.peer_id == target_id) {
            return vec![record.addr];
        }
        // Target not directly reachable: flood and let a closer node take
        // the shortcut.
    }

    active
        .iter()
        .filter(|peer| Some(peer.addr) != arrived_from)
        .map(|peer| peer.addr)
        .collect()
}

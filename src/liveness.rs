//! Liveness: heartbeat unicasts to known peers, plus the staleness sweep
//! that demotes quiet peers and expires the dedup cache.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::events::{EventSender, NodeEvent};
use crate::identity::NodeIdentity;
use crate::message::cache::MessageCache;
use crate::message::codec;
use crate::message::{MeshMessage, Payload};
use crate::peer::PeerTable;
use crate::transport::Transport;

/// Heartbeats are point-to-point liveness probes; one hop is all they get.
const HEARTBEAT_TTL: u8 = 1;

pub struct LivenessService {
    identity: Arc<NodeIdentity>,
    peers: Arc<PeerTable>,
    cache: Arc<MessageCache>,
    transport: Arc<Transport>,
    events: EventSender,
    config: Config,
    running: watch::Receiver<bool>,
}

impl LivenessService {
    pub fn new(
        identity: Arc<NodeIdentity>,
        peers: Arc<PeerTable>,
        cache: Arc<MessageCache>,
        transport: Arc<Transport>,
        events: EventSender,
        config: Config,
        running: watch::Receiver<bool>,
    ) -> Self {
        Self {
            identity,
            peers,
            cache,
            transport,
            events,
            config,
            running,
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeats = self.clone();
        let sweeper = self;
        vec![
            tokio::spawn(async move { heartbeats.heartbeat_loop().await }),
            tokio::spawn(async move { sweeper.sweep_loop().await }),
        ]
    }

    async fn heartbeat_loop(&self) {
        let mut running = self.running.clone();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_heartbeats().await;
                }
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat sender stopped");
    }

    async fn send_heartbeats(&self) {
        for record in self.peers.active_peers() {
            let beat = MeshMessage::new(&self.identity.node_id, Payload::Heartbeat {}, HEARTBEAT_TTL)
                .with_target(&record.peer_id);
            let frame = match codec::encode(&beat) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("cannot encode heartbeat for {}: {err}", record.peer_id);
                    continue;
                }
            };
            // One failed peer never blocks the rest of the round.
            if let Err(err) = self.transport.send_to(&frame, record.addr).await {
                warn!("heartbeat to {} failed: {err}", record.peer_id);
            }
        }
    }

    async fn sweep_loop(&self) {
        let mut running = self.running.clone();
        let mut ticker = tokio::time::interval(self.config.sweep_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("staleness sweeper stopped");
    }

    fn sweep_once(&self) {
        let lost = self
            .peers
            .sweep(self.config.staleness_window(), self.config.peer_retention());
        for peer_id in lost {
            info!("peer {peer_id} went stale");
            let _ = self.events.send(NodeEvent::PeerDisconnected { peer_id });
        }

        let evicted = self.cache.evict_expired(self.config.cache_retention());
        if evicted > 0 {
            debug!("evicted {evicted} expired message ids");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, SocketAddr};
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use crate::transport::StaticAddresses;

    use super::*;

    async fn service(config: Config) -> (Arc<LivenessService>, watch::Sender<bool>) {
        let transport = Arc::new(
            Transport::bind(&config, &StaticAddresses::from_config(&config))
                .await
                .unwrap(),
        );
        let (events, _rx) = crate::events::channel();
        let (tx, rx) = watch::channel(true);
        let service = Arc::new(LivenessService::new(
            Arc::new(NodeIdentity::with_id("SELF0001", "self")),
            Arc::new(PeerTable::new()),
            Arc::new(MessageCache::new()),
            transport,
            events,
            config,
            rx,
        ));
        (service, tx)
    }

    fn test_config() -> Config {
        Config {
            message_port: 0,
            discovery_port: 0,
            local_ip: IpAddr::from([127, 0, 0, 1]),
            broadcast_addr: IpAddr::from([127, 0, 0, 1]),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn heartbeats_are_unicast_per_active_peer() {
        let (service, _stop) = service(test_config()).await;
        let peer_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        service
            .peers
            .upsert("PEER0001", peer_socket.local_addr().unwrap());

        service.send_heartbeats().await;

        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(
            Duration::from_millis(300),
            peer_socket.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let beat = codec::decode(&buf[..n]).unwrap();
        assert_eq!(beat.payload, Payload::Heartbeat {});
        assert_eq!(beat.sender_id, "SELF0001");
        assert_eq!(beat.target_id.as_deref(), Some("PEER0001"));
        assert_eq!(beat.ttl, HEARTBEAT_TTL);
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_block_the_round() {
        let (service, _stop) = service(test_config()).await;
        // A peer with a hopeless address plus a reachable one.
        service
            .peers
            .upsert("DEAD0001", SocketAddr::from(([127, 0, 0, 1], 1)));
        let peer_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        service
            .peers
            .upsert("PEER0001", peer_socket.local_addr().unwrap());

        service.send_heartbeats().await;

        let mut buf = vec![0u8; 4096];
        let received = tokio::time::timeout(
            Duration::from_millis(300),
            peer_socket.recv_from(&mut buf),
        )
        .await;
        assert!(received.is_ok());
    }

    #[tokio::test]
    async fn unencodable_heartbeat_skips_to_the_next_peer() {
        let (service, _stop) = service(test_config()).await;
        // A peer id so large its heartbeat frame exceeds the datagram
        // budget and cannot be encoded.
        service
            .peers
            .upsert(&"X".repeat(70_000), SocketAddr::from(([127, 0, 0, 1], 9000)));
        let peer_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        service
            .peers
            .upsert("PEER0001", peer_socket.local_addr().unwrap());

        service.send_heartbeats().await;

        let mut buf = vec![0u8; 4096];
        let received = tokio::time::timeout(
            Duration::from_millis(300),
            peer_socket.recv_from(&mut buf),
        )
        .await;
        assert!(received.is_ok(), "round aborted before the healthy peer");
    }

    #[tokio::test]
    async fn sweep_emits_disconnect_exactly_once() {
        let mut config = test_config();
        config.staleness_window_secs = 0;
        config.peer_retention_factor = u32::MAX;
        let (service, _stop) = service(config).await;
        let mut events = service.events.subscribe();

        service
            .peers
            .upsert("PEER0001", SocketAddr::from(([127, 0, 0, 1], 9000)));
        tokio::time::sleep(Duration::from_millis(5)).await;

        service.sweep_once();
        service.sweep_once();

        match events.try_recv() {
            Ok(NodeEvent::PeerDisconnected { peer_id }) => assert_eq!(peer_id, "PEER0001"),
            other => panic!("expected PeerDisconnected, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "disconnect fired twice");
    }
}

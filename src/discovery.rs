//! Discovery: periodic presence beacon plus a passive listener that feeds
//! the peer table.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::events::{EventSender, NodeEvent};
use crate::identity::NodeIdentity;
use crate::message::codec::{self, MAX_DATAGRAM};
use crate::message::{MeshMessage, Payload};
use crate::peer::PeerTable;
use crate::transport::Transport;

/// Discovery beacons never travel beyond the local segment.
const BEACON_TTL: u8 = 1;

pub struct DiscoveryService {
    identity: Arc<NodeIdentity>,
    peers: Arc<PeerTable>,
    transport: Arc<Transport>,
    events: EventSender,
    config: Config,
    running: watch::Receiver<bool>,
}

impl DiscoveryService {
    pub fn new(
        identity: Arc<NodeIdentity>,
        peers: Arc<PeerTable>,
        transport: Arc<Transport>,
        events: EventSender,
        config: Config,
        running: watch::Receiver<bool>,
    ) -> Self {
        Self {
            identity,
            peers,
            transport,
            events,
            config,
            running,
        }
    }

    /// Spawn the broadcast and listener loops. Both observe the stop
    /// signal within one interval / receive timeout.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let broadcaster = self.clone();
        let listener = self;
        vec![
            tokio::spawn(async move { broadcaster.broadcast_loop().await }),
            tokio::spawn(async move { listener.listen_loop().await }),
        ]
    }

    async fn broadcast_loop(&self) {
        let mut running = self.running.clone();
        let mut ticker = tokio::time::interval(self.config.discovery_interval());
        info!(
            "discovery: announcing {} every {:?}",
            self.identity.node_id,
            self.config.discovery_interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_beacon().await;
                }
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("discovery broadcaster stopped");
    }

    async fn send_beacon(&self) {
        // Fresh msg_id per beacon; receivers key the peer on sender_id.
        let beacon = MeshMessage::new(
            &self.identity.node_id,
            Payload::Discovery {
                display_name: self.identity.display_name.clone(),
                message_ip: self.transport.local_ip(),
                message_port: self.transport.message_port(),
            },
            BEACON_TTL,
        );
        match codec::encode(&beacon) {
            Ok(frame) => {
                if let Err(err) = self.transport.broadcast(&frame).await {
                    // Transient: no route, interface flap. Next tick retries.
                    warn!("discovery beacon failed: {err}");
                }
            }
            Err(err) => warn!("cannot encode discovery beacon: {err}"),
        }
    }

    async fn listen_loop(&self) {
        let running = self.running.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while *running.borrow() {
            let Some((len, src)) = self.transport.recv_discovery(&mut buf).await else {
                continue;
            };
            self.handle_beacon(&buf[..len], src);
        }
        debug!("discovery listener stopped");
    }

    fn handle_beacon(&self, frame: &[u8], src: SocketAddr) {
        let msg = match codec::decode(frame) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("undecodable discovery datagram from {src}: {err}");
                return;
            }
        };
        let Payload::Discovery {
            display_name,
            message_ip,
            message_port,
        } = &msg.payload
        else {
            debug!("non-discovery payload on discovery port from {src}");
            return;
        };
        // Our own beacon comes back off the broadcast address.
        if msg.sender_id == self.identity.node_id {
            return;
        }

        // The beacon names where unicast messages should go; the datagram's
        // source port is the discovery socket, not that. An unspecified
        // announced ip carries no information, so the source ip stands in.
        let ip = if message_ip.is_unspecified() {
            src.ip()
        } else {
            *message_ip
        };
        let addr = SocketAddr::new(ip, *message_port);
        if self.peers.upsert(&msg.sender_id, addr) {
            info!("discovered peer {} ({display_name}) at {addr}", msg.sender_id);
            let _ = self.events.send(NodeEvent::PeerConnected {
                peer_id: msg.sender_id.clone(),
                addr,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::message::DEFAULT_TTL;
    use crate::transport::StaticAddresses;

    use super::*;

    async fn service() -> (Arc<DiscoveryService>, watch::Sender<bool>) {
        let config = Config {
            message_port: 0,
            discovery_port: 0,
            local_ip: IpAddr::from([127, 0, 0, 1]),
            broadcast_addr: IpAddr::from([127, 0, 0, 1]),
            ..Config::default()
        };
        let transport = Arc::new(
            Transport::bind(&config, &StaticAddresses::from_config(&config))
                .await
                .unwrap(),
        );
        let (events, _rx) = crate::events::channel();
        let (tx, rx) = watch::channel(true);
        let service = Arc::new(DiscoveryService::new(
            Arc::new(NodeIdentity::with_id("SELF0001", "self")),
            Arc::new(PeerTable::new()),
            transport,
            events,
            config,
            rx,
        ));
        (service, tx)
    }

    fn beacon_from(sender: &str, message_ip: IpAddr, message_port: u16) -> Vec<u8> {
        let msg = MeshMessage::new(
            sender,
            Payload::Discovery {
                display_name: "them".into(),
                message_ip,
                message_port,
            },
            BEACON_TTL,
        );
        codec::encode(&msg).unwrap()
    }

    #[tokio::test]
    async fn unspecified_beacon_ip_falls_back_to_the_source_address() {
        let (service, _stop) = service().await;
        let src = SocketAddr::from(([127, 0, 0, 1], 50123));

        service.handle_beacon(&beacon_from("PEER0001", IpAddr::from([0, 0, 0, 0]), 7777), src);

        let record = service.peers.get("PEER0001").unwrap();
        assert_eq!(record.addr, SocketAddr::from(([127, 0, 0, 1], 7777)));
        assert!(record.active);
    }

    #[tokio::test]
    async fn announced_beacon_ip_overrides_the_source_address() {
        let (service, _stop) = service().await;
        let src = SocketAddr::from(([127, 0, 0, 1], 50123));

        service.handle_beacon(&beacon_from("PEER0001", IpAddr::from([10, 1, 2, 3]), 7777), src);

        let record = service.peers.get("PEER0001").unwrap();
        assert_eq!(record.addr, SocketAddr::from(([10, 1, 2, 3], 7777)));
    }

    #[tokio::test]
    async fn own_beacon_is_ignored() {
        let (service, _stop) = service().await;
        let src = SocketAddr::from(([127, 0, 0, 1], 50123));

        service.handle_beacon(&beacon_from("SELF0001", IpAddr::from([0, 0, 0, 0]), 7777), src);
        assert!(service.peers.is_empty());
    }

    #[tokio::test]
    async fn malformed_beacons_are_dropped_silently() {
        let (service, _stop) = service().await;
        let src = SocketAddr::from(([127, 0, 0, 1], 50123));

        service.handle_beacon(b"{]", src);
        // A valid envelope that is not a DISCOVERY payload is ignored too.
        let text = MeshMessage::new(
            "PEER0001",
            Payload::Text { text: "hi".into() },
            DEFAULT_TTL,
        );
        service.handle_beacon(&codec::encode(&text).unwrap(), src);
        assert!(service.peers.is_empty());
    }
}

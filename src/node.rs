//! Mesh node composition root.
//!
//! Owns the peer table, dedup cache and transfer state; wires the services
//! together at `start` and tears them down at `stop`. Everything handed
//! out across this boundary is a copy or a snapshot.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::DiscoveryService;
use crate::error::{MeshError, Result};
use crate::events::{self, EventReceiver, EventSender, NodeEvent};
use crate::identity::NodeIdentity;
use crate::liveness::LivenessService;
use crate::message::cache::MessageCache;
use crate::message::codec::{self, MAX_DATAGRAM};
use crate::message::{MeshMessage, MessageKind, Payload};
use crate::peer::{PeerRecord, PeerTable};
use crate::relay::RelayEngine;
use crate::transfer::{FileTransferManager, FileTransferState};
use crate::transport::{AddressProvider, NetworkFormation, Transport};

/// How long `stop` waits for each service task before abandoning it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything that only exists while the node runs.
struct Running {
    transport: Arc<Transport>,
    relay: Arc<RelayEngine>,
    transfers: Arc<FileTransferManager>,
    formation: Arc<dyn NetworkFormation>,
    running_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MeshNode {
    identity: Arc<NodeIdentity>,
    config: Config,
    peers: Arc<PeerTable>,
    cache: Arc<MessageCache>,
    events: EventSender,
    /// Local history of application messages, sent and received.
    messages: Arc<parking_lot::Mutex<Vec<MeshMessage>>>,
    inner: Mutex<Option<Running>>,
}

impl MeshNode {
    pub fn new(config: Config) -> Self {
        let identity = Arc::new(NodeIdentity::new(config.display_name.clone()));
        Self::with_identity(identity, config)
    }

    pub fn with_identity(identity: Arc<NodeIdentity>, config: Config) -> Self {
        let (events, _initial) = events::channel();
        Self {
            identity,
            config,
            peers: Arc::new(PeerTable::new()),
            cache: Arc::new(MessageCache::new()),
            events,
            messages: Arc::new(parking_lot::Mutex::new(Vec::new())),
            inner: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    pub fn display_name(&self) -> &str {
        &self.identity.display_name
    }

    /// Subscribe to node events; each subscriber gets its own copy stream.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Bind sockets, spawn the service loops, go live. Idempotent: a
    /// running node stays running.
    pub async fn start(
        &self,
        addrs: Arc<dyn AddressProvider>,
        formation: Arc<dyn NetworkFormation>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            debug!("node {} already running", self.identity.node_id);
            return Ok(());
        }

        formation.form()?;
        let transport = match Transport::bind(&self.config, addrs.as_ref()).await {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                let _ = formation.dissolve();
                return Err(err);
            }
        };

        let relay = Arc::new(RelayEngine::new(
            self.identity.node_id.clone(),
            self.peers.clone(),
            self.cache.clone(),
            transport.clone(),
            self.events.clone(),
        ));

        let transfers = Arc::new(FileTransferManager::new(
            self.identity.clone(),
            relay.clone(),
            self.events.clone(),
            self.config.clone(),
        ));

        // Application history for TEXT messages.
        let history = self.messages.clone();
        relay.register_handler(
            MessageKind::Text,
            Arc::new(move |msg| {
                history.lock().push(msg.clone());
                Ok(())
            }),
        );

        // File messages hop from the relay's dispatch into the transfer
        // worker through an unbounded channel; the handler itself stays
        // non-blocking.
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        for kind in [MessageKind::FileInfo, MessageKind::FileChunk] {
            let tx = transfer_tx.clone();
            relay.register_handler(
                kind,
                Arc::new(move |msg| {
                    tx.send(msg.clone())
                        .map_err(|_| anyhow::anyhow!("transfer worker gone"))
                }),
            );
        }

        let (running_tx, running_rx) = watch::channel(true);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(transfers.clone().run(transfer_rx, running_rx.clone())));
        tasks.extend(self.spawn_message_pipeline(transport.clone(), relay.clone(), running_rx.clone()));

        let discovery = Arc::new(DiscoveryService::new(
            self.identity.clone(),
            self.peers.clone(),
            transport.clone(),
            self.events.clone(),
            self.config.clone(),
            running_rx.clone(),
        ));
        tasks.extend(discovery.spawn());

        let liveness = Arc::new(LivenessService::new(
            self.identity.clone(),
            self.peers.clone(),
            self.cache.clone(),
            transport.clone(),
            self.events.clone(),
            self.config.clone(),
            running_rx,
        ));
        tasks.extend(liveness.spawn());

        info!(
            "node {} ({}) up: messages on {}, discovery on {}",
            self.identity.node_id,
            self.identity.display_name,
            transport.message_port(),
            transport.discovery_port()
        );

        *inner = Some(Running {
            transport,
            relay,
            transfers,
            formation,
            running_tx,
            tasks,
        });
        Ok(())
    }

    /// Listener and processor, decoupled by a bounded queue so a slow
    /// handler cannot stall socket reads. When the queue fills, the
    /// listener waits for space rather than dropping silently.
    fn spawn_message_pipeline(
        &self,
        transport: Arc<Transport>,
        relay: Arc<RelayEngine>,
        running: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(self.config.queue_depth);

        let listener_running = running.clone();
        let listener = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while *listener_running.borrow() {
                let Some((len, src)) = transport.recv_message(&mut buf).await else {
                    continue;
                };
                if raw_tx.send((buf[..len].to_vec(), src)).await.is_err() {
                    break;
                }
            }
            debug!("message listener stopped");
        });

        let processor = tokio::spawn(async move {
            loop {
                let datagram = tokio::select! {
                    datagram = raw_rx.recv() => datagram,
                    _ = shutdown(running.clone()) => None,
                };
                let Some((frame, src)) = datagram else { break };
                match codec::decode(&frame) {
                    Ok(msg) => relay.process_inbound(msg, src).await,
                    // Malformed payloads are dropped, never raised.
                    Err(err) => debug!("undecodable datagram from {src}: {err}"),
                }
            }
            debug!("message processor stopped");
        });

        vec![listener, processor]
    }

    /// Stop the node: signal the loops, release sockets, wait (bounded)
    /// for the tasks. Idempotent and safe to call from a shutdown hook.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(running) = inner.take() else {
            return Ok(());
        };

        let _ = running.running_tx.send(false);
        for mut task in running.tasks {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("service task did not stop in time, aborting it");
                task.abort();
            }
        }
        drop(running.transport);
        drop(running.relay);
        drop(running.transfers);
        running.formation.dissolve()?;

        info!("node {} stopped", self.identity.node_id);
        Ok(())
    }

    /// Send a text message into the mesh; `target_id` narrows it to one
    /// recipient (best-effort, still flood-routed when the target is not
    /// a direct peer).
    pub async fn send_text(&self, text: impl Into<String>, target_id: Option<&str>) -> Result<Uuid> {
        let relay = self.relay().await?;
        let mut msg = MeshMessage::new(
            &self.identity.node_id,
            Payload::Text { text: text.into() },
            self.config.default_ttl,
        );
        if let Some(target) = target_id {
            msg = msg.with_target(target);
        }
        let msg_id = msg.msg_id;
        self.messages.lock().push(msg.clone());
        relay.send(msg).await?;
        Ok(msg_id)
    }

    /// Offer a file to the mesh (or one peer) and start streaming chunks.
    pub async fn send_file(
        &self,
        path: &Path,
        chunk_size: Option<u32>,
        target_id: Option<String>,
    ) -> Result<Uuid> {
        let transfers = self.transfers().await?;
        transfers.send_file(path, chunk_size, target_id).await
    }

    pub async fn accept_file(&self, file_id: Uuid, save_path: &Path) -> Result<()> {
        self.transfers().await?.accept_file(file_id, save_path)
    }

    pub async fn reject_file(&self, file_id: Uuid) -> Result<()> {
        self.transfers().await?.reject_file(file_id)
    }

    pub async fn transfer(&self, file_id: Uuid) -> Result<Option<FileTransferState>> {
        Ok(self.transfers().await?.transfer(file_id))
    }

    /// Manually seed a peer, for operator-known addresses or segments
    /// where broadcast is filtered.
    pub fn add_peer(&self, peer_id: &str, addr: SocketAddr) {
        if peer_id == self.identity.node_id {
            return;
        }
        if self.peers.upsert(peer_id, addr) {
            info!("peer {peer_id} added manually at {addr}");
            let _ = self.events.send(NodeEvent::PeerConnected {
                peer_id: peer_id.to_string(),
                addr,
            });
        }
    }

    /// Copy of the current peer table.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    pub fn active_peers(&self) -> Vec<PeerRecord> {
        self.peers.active_peers()
    }

    /// Copy of the local message history.
    pub fn messages(&self) -> Vec<MeshMessage> {
        self.messages.lock().clone()
    }

    /// Port the message socket bound, available while running. Tests use
    /// this with ephemeral ports.
    pub async fn message_port(&self) -> Result<u16> {
        let inner = self.inner.lock().await;
        inner
            .as_ref()
            .map(|running| running.transport.message_port())
            .ok_or(MeshError::NotRunning)
    }

    async fn relay(&self) -> Result<Arc<RelayEngine>> {
        let inner = self.inner.lock().await;
        inner
            .as_ref()
            .map(|running| running.relay.clone())
            .ok_or(MeshError::NotRunning)
    }

    async fn transfers(&self) -> Result<Arc<FileTransferManager>> {
        let inner = self.inner.lock().await;
        inner
            .as_ref()
            .map(|running| running.transfers.clone())
            .ok_or(MeshError::NotRunning)
    }
}

async fn shutdown(mut running: watch::Receiver<bool>) {
    while *running.borrow() {
        if running.changed().await.is_err() {
            break;
        }
    }
}

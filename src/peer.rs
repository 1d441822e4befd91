//! Peer table: every node this one has heard from, and whether it is
//! still considered alive.
//!
//! All mutation goes through this type; the map itself is never exposed.
//! Readers get snapshots, so concurrent sweeps and upserts can never be
//! observed mid-update.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Record of a known peer. `active` flips to false when the peer goes
/// stale; the record itself lingers for a retention window before purging,
/// so a briefly-silent peer keeps its history.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub active: bool,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: DashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record liveness evidence for a peer. Every inbound datagram
    /// attributable to a peer counts, not just heartbeats.
    ///
    /// Returns `true` when the peer transitioned to active (first sighting,
    /// or back from stale), so the caller can emit a connected notification
    /// exactly once per transition.
    pub fn upsert(&self, peer_id: &str, addr: SocketAddr) -> bool {
        match self.peers.entry(peer_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                let was_inactive = !record.active;
                record.addr = addr;
                record.last_seen = Instant::now();
                record.active = true;
                was_inactive
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PeerRecord {
                    peer_id: peer_id.to_string(),
                    addr,
                    last_seen: Instant::now(),
                    active: true,
                });
                true
            }
        }
    }

    /// Demote peers silent for longer than `staleness` and purge records
    /// idle past `retention`. Returns the ids demoted by *this* call, so
    /// "peer lost" fires once per transition rather than once per sweep.
    pub fn sweep(&self, staleness: Duration, retention: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut lost = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let record = entry.value_mut();
            if record.active && now.duration_since(record.last_seen) > staleness {
                record.active = false;
                lost.push(record.peer_id.clone());
            }
        }

        self.peers
            .retain(|_, record| now.duration_since(record.last_seen) <= retention);

        lost
    }

    /// Immutable copy of every record, safe to iterate while the table
    /// keeps changing underneath.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot filtered to live peers; these are the relay fan-out targets.
    pub fn active_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .filter(|entry| entry.value().active)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

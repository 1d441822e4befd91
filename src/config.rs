//! Node configuration.
//!
//! Every timer, window and port from the protocol is a field here so tests
//! and deployments can shrink or stretch them; the defaults match the values
//! the protocol was tuned with in the field.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Human-readable name announced in discovery beacons.
    pub display_name: String,

    /// Primary unicast message port. Fallback tries the next
    /// `port_fallback_attempts` ports before giving up. Port 0 binds an
    /// ephemeral port (useful for tests).
    pub message_port: u16,

    /// Primary discovery broadcast port, with the same fallback rule.
    /// Keep its fallback range clear of the message-port range, or a
    /// beacon aimed at a fallback discovery port can land on another
    /// node's message socket.
    pub discovery_port: u16,

    /// How many consecutive ports to try after the primary one.
    pub port_fallback_attempts: u16,

    /// Address this host is reachable on, as reported to peers.
    pub local_ip: IpAddr,

    /// Subnet broadcast address discovery beacons are sent to.
    pub broadcast_addr: IpAddr,

    /// Max hops for messages originated by this node.
    pub default_ttl: u8,

    /// Seconds between discovery beacons.
    pub discovery_interval_secs: u64,

    /// Seconds between heartbeat rounds.
    pub heartbeat_interval_secs: u64,

    /// Seconds between staleness sweeps.
    pub sweep_interval_secs: u64,

    /// A peer not heard from for this long is demoted to inactive. Keep it
    /// a multiple of the heartbeat interval so a single dropped packet does
    /// not demote a live peer.
    pub staleness_window_secs: u64,

    /// Inactive peer records are purged after
    /// `staleness_window_secs * peer_retention_factor`.
    pub peer_retention_factor: u32,

    /// How long seen message ids are remembered for deduplication.
    pub cache_retention_secs: u64,

    /// Default file chunk size in bytes. Bounded by the datagram budget
    /// (chunks travel hex-encoded inside a single UDP datagram).
    pub chunk_size: u32,

    /// Pause between chunk sends so a transfer does not saturate the
    /// shared radio link.
    pub chunk_send_delay_ms: u64,

    /// Depth of the queue between the socket listener and the message
    /// processor. When full, the listener waits instead of dropping.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            message_port: 5555,
            discovery_port: 5560,
            port_fallback_attempts: 4,
            local_ip: IpAddr::from([0, 0, 0, 0]),
            broadcast_addr: IpAddr::from([255, 255, 255, 255]),
            default_ttl: 10,
            discovery_interval_secs: 5,
            heartbeat_interval_secs: 5,
            sweep_interval_secs: 60,
            staleness_window_secs: 30,
            peer_retention_factor: 4,
            cache_retention_secs: 300,
            chunk_size: 16 * 1024,
            chunk_send_delay_ms: 25,
            queue_depth: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn peer_retention(&self) -> Duration {
        self.staleness_window() * self.peer_retention_factor
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(self.cache_retention_secs)
    }

    pub fn chunk_send_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_send_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.message_port, 5555);
        assert_eq!(cfg.default_ttl, 10);
        // at least two missed heartbeats before demotion
        assert!(cfg.staleness_window_secs >= 2 * cfg.heartbeat_interval_secs);
        assert_eq!(cfg.peer_retention(), Duration::from_secs(120));
        // discovery fallback range must not overlap the message fallback
        // range, so beacons never land on a message socket
        assert!(cfg.discovery_port > cfg.message_port + cfg.port_fallback_attempts);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"display_name":"base-camp","message_port":6000}"#).unwrap();
        assert_eq!(cfg.display_name, "base-camp");
        assert_eq!(cfg.message_port, 6000);
        assert_eq!(cfg.discovery_port, 5560);
    }
}

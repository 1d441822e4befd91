//! UDP transport: one socket for discovery broadcast, one for unicast
//! messages.
//!
//! A single UDP socket handles concurrent sends from multiple tasks, so
//! every outbound unicast goes through the message socket; replies then
//! arrive from the peer's bound message port, which makes the datagram
//! source address a usable peer endpoint.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::config::Config;
use crate::error::{MeshError, Result};

/// Socket receives use a short timeout so service loops can observe the
/// stop signal promptly instead of blocking in `recv_from`.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Returns this host's usable address and the subnet broadcast address.
/// Supplied by the platform layer; the core never shells out to OS
/// network tooling.
pub trait AddressProvider: Send + Sync {
    fn local_ip(&self) -> IpAddr;
    fn broadcast_addr(&self) -> IpAddr;
}

/// Fixed addresses, typically read from [`Config`].
#[derive(Debug, Clone)]
pub struct StaticAddresses {
    pub local: IpAddr,
    pub broadcast: IpAddr,
}

impl StaticAddresses {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local: config.local_ip,
            broadcast: config.broadcast_addr,
        }
    }
}

impl AddressProvider for StaticAddresses {
    fn local_ip(&self) -> IpAddr {
        self.local
    }

    fn broadcast_addr(&self) -> IpAddr {
        self.broadcast
    }
}

/// Creates or joins the underlying radio network (hotspot, ad-hoc WiFi).
/// External collaborator; the core only needs it formed before sockets
/// bind and dissolved after they close.
pub trait NetworkFormation: Send + Sync {
    fn form(&self) -> Result<()>;
    fn dissolve(&self) -> Result<()>;
}

/// For deployments where the network already exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFormation;

impl NetworkFormation for NoFormation {
    fn form(&self) -> Result<()> {
        Ok(())
    }

    fn dissolve(&self) -> Result<()> {
        Ok(())
    }
}

pub struct Transport {
    message_socket: UdpSocket,
    discovery_socket: UdpSocket,
    message_port: u16,
    discovery_port: u16,
    /// Beacons target every port in the fallback sequence so that nodes
    /// pushed off the primary discovery port still hear each other.
    discovery_targets: Vec<u16>,
    broadcast_addr: IpAddr,
    local_ip: IpAddr,
}

impl Transport {
    pub async fn bind(config: &Config, addrs: &dyn AddressProvider) -> Result<Self> {
        let attempts = config.port_fallback_attempts;
        let (message_socket, message_port) =
            bind_with_fallback(config.message_port, attempts).await?;
        let (discovery_socket, discovery_port) =
            bind_with_fallback(config.discovery_port, attempts).await?;
        discovery_socket.set_broadcast(true)?;

        // An ephemeral discovery port (0) is unreachable by beacon, so it
        // contributes no broadcast targets.
        let discovery_targets = if config.discovery_port == 0 {
            Vec::new()
        } else {
            (0..=attempts)
                .map(|offset| config.discovery_port.wrapping_add(offset))
                .collect()
        };

        Ok(Self {
            message_socket,
            discovery_socket,
            message_port,
            discovery_port,
            discovery_targets,
            broadcast_addr: addrs.broadcast_addr(),
            local_ip: addrs.local_ip(),
        })
    }

    /// Address this host announces as reachable in discovery beacons.
    /// Unspecified (0.0.0.0) when the platform layer has nothing better;
    /// receivers then fall back to the datagram source address.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Port the message socket actually bound (after fallback).
    pub fn message_port(&self) -> u16 {
        self.message_port
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    /// Unicast one frame to one peer. Failures here are transient by
    /// definition; callers log and move on to the next peer.
    pub async fn send_to(&self, frame: &[u8], addr: SocketAddr) -> Result<()> {
        self.message_socket
            .send_to(frame, addr)
            .await
            .map_err(|source| MeshError::Send { addr, source })?;
        Ok(())
    }

    /// Broadcast a discovery frame to the subnet, once per candidate port.
    pub async fn broadcast(&self, frame: &[u8]) -> Result<()> {
        let mut last_err = None;
        for port in &self.discovery_targets {
            let addr = SocketAddr::new(self.broadcast_addr, *port);
            if let Err(source) = self.discovery_socket.send_to(frame, addr).await {
                debug!("discovery broadcast to {addr} failed: {source}");
                last_err = Some(MeshError::Send { addr, source });
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Receive on the message socket. `None` means the timeout elapsed or
    /// a transient receive error was logged; the caller just loops.
    pub async fn recv_message(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        recv_with_timeout(&self.message_socket, buf, "message").await
    }

    pub async fn recv_discovery(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        recv_with_timeout(&self.discovery_socket, buf, "discovery").await
    }
}

async fn recv_with_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
    label: &str,
) -> Option<(usize, SocketAddr)> {
    match tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(buf)).await {
        Ok(Ok(received)) => Some(received),
        Ok(Err(err)) => {
            warn!("{label} socket receive error: {err}");
            None
        }
        Err(_elapsed) => None,
    }
}

async fn bind_with_fallback(base: u16, attempts: u16) -> Result<(UdpSocket, u16)> {
    for offset in 0..=attempts {
        let candidate = base.wrapping_add(offset);
        match UdpSocket::bind(("0.0.0.0", candidate)).await {
            Ok(socket) => {
                // Port 0 binds an ephemeral port; report the real one.
                let bound = socket.local_addr()?.port();
                if offset > 0 {
                    warn!("port {base} busy, fell back to {bound}");
                }
                return Ok((socket, bound));
            }
            Err(err) => debug!("port {candidate} unavailable: {err}"),
        }
        // Port 0 always succeeds, so reaching here means a real conflict;
        // trying offsets of 0 again would re-bind ephemeral ports.
        if base == 0 {
            break;
        }
    }
    Err(MeshError::PortsExhausted {
        base,
        attempted: attempts as usize + 1,
    })
}

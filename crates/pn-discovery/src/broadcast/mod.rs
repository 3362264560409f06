//! Broadcast transport — one UDP socket, fanned out to every subnet.
//!
//! A single global broadcast is not routed by every link layer, and some
//! drivers drop it outright. Each send therefore goes to the directed
//! broadcast address of every up, broadcast-capable interface, then to
//! 255.255.255.255, then to any configured static peers. Every destination
//! is attempted independently; failures are logged and swallowed.
//!
//! The same socket is used for receiving, so the announcer and the listener
//! share one handle.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use pn_core::DiscoveryConfig;

use crate::error::DiscoveryError;

#[cfg(unix)]
#[path = "unix.rs"]
mod platform;

#[cfg(not(unix))]
#[path = "fallback.rs"]
mod platform;

/// One IPv4 address bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub up: bool,
    pub broadcast: bool,
    pub loopback: bool,
}

impl Interface {
    /// Directed broadcast address, if this interface can carry one.
    pub fn broadcast_addr(&self) -> Option<Ipv4Addr> {
        if !(self.up && self.broadcast) {
            return None;
        }
        self.netmask.map(|mask| subnet_broadcast(self.addr, mask))
    }
}

/// `ip | !mask`
pub fn subnet_broadcast(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// Distinct directed broadcast addresses across `interfaces`, in order.
pub fn broadcast_targets(interfaces: &[Interface]) -> Vec<Ipv4Addr> {
    let mut targets = Vec::new();
    for addr in interfaces.iter().filter_map(Interface::broadcast_addr) {
        if !targets.contains(&addr) {
            targets.push(addr);
        }
    }
    targets
}

/// First non-loopback address on an up interface.
pub fn pick_local_address(interfaces: &[Interface]) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .find(|i| i.up && !i.loopback && !i.addr.is_loopback())
        .map(|i| i.addr)
}

/// The address this instance reports in presence messages.
///
/// Falls back to 127.0.0.1 when no usable interface exists. Only fails if
/// interfaces cannot be enumerated and the routing probe fails as well.
pub fn resolve_local_address() -> Result<Ipv4Addr, DiscoveryError> {
    match platform::interfaces() {
        Ok(interfaces) => Ok(pick_local_address(&interfaces).unwrap_or(Ipv4Addr::LOCALHOST)),
        Err(e) => {
            tracing::debug!(error = %e, "interface enumeration failed, probing route");
            probe_local_address().map_err(DiscoveryError::LocalAddress)
        }
    }
}

/// Ask the kernel which source address it would route through.
/// Connecting a UDP socket sends nothing.
fn probe_local_address() -> io::Result<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    match probe.local_addr()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Ok(*v4.ip()),
        _ => Ok(Ipv4Addr::LOCALHOST),
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub struct BroadcastTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Destination port for broadcast sends.
    port: u16,
    broadcast: bool,
    static_peers: Vec<SocketAddr>,
}

impl BroadcastTransport {
    /// Bind the discovery socket described by `config`.
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let port = config.port();
        Self::bind_to(
            SocketAddrV4::new(config.network.bind_addr, port),
            port,
            config.network.broadcast,
            config.network.static_peers.clone(),
        )
    }

    pub fn bind_to(
        addr: SocketAddrV4,
        port: u16,
        broadcast: bool,
        static_peers: Vec<SocketAddr>,
    ) -> Result<Self, DiscoveryError> {
        let socket = make_broadcast_socket(addr)?;
        let socket = UdpSocket::from_std(socket).map_err(DiscoveryError::Socket)?;
        let local_addr = socket.local_addr().map_err(DiscoveryError::Socket)?;

        tracing::debug!(
            %local_addr,
            port,
            broadcast,
            static_peers = static_peers.len(),
            "discovery socket bound"
        );

        Ok(Self {
            socket,
            local_addr,
            port,
            broadcast,
            static_peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Every address a message goes to right now. Interfaces are enumerated
    /// on each call so addresses that come and go are picked up.
    pub fn destinations(&self) -> Vec<SocketAddr> {
        let mut out: Vec<SocketAddr> = Vec::new();

        if self.broadcast {
            match platform::interfaces() {
                Ok(interfaces) => out.extend(
                    broadcast_targets(&interfaces)
                        .into_iter()
                        .map(|ip| SocketAddr::from((ip, self.port))),
                ),
                Err(e) => tracing::trace!(error = %e, "no interface list, global broadcast only"),
            }
            let global = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
            if !out.contains(&global) {
                out.push(global);
            }
        }

        for peer in &self.static_peers {
            if !out.contains(peer) {
                out.push(*peer);
            }
        }
        out
    }

    /// Send `payload` to every destination. Returns how many sends succeeded.
    pub async fn send(&self, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for dest in self.destinations() {
            match self.socket.send_to(payload, dest).await {
                Ok(n) => {
                    delivered += 1;
                    tracing::trace!(%dest, bytes = n, "datagram sent");
                }
                Err(e) => tracing::debug!(%dest, error = %e, "send failed"),
            }
        }
        delivered
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Create a UDP socket allowed to send broadcasts and share its port.
fn make_broadcast_socket(addr: SocketAddrV4) -> Result<std::net::UdpSocket, DiscoveryError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoveryError::Socket)?;

    socket.set_broadcast(true).map_err(DiscoveryError::Broadcast)?;
    if let Err(e) = socket.set_reuse_address(true) {
        tracing::warn!(error = %e, "SO_REUSEADDR unavailable");
    }
    socket.set_nonblocking(true).map_err(DiscoveryError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| DiscoveryError::Bind {
            addr: addr.into(),
            source,
        })?;

    Ok(socket.into())
}

//! Phoenix Nest discovery integration harness.
//!
//! Every test builds real `Discovery` contexts on 127.0.0.1. Broadcast is
//! switched off and each context is given the others as static peers, so
//! the tests need no privileges and never touch the LAN.
//!
//!   cargo test --test integration

mod discovery;
mod expiry;
mod failures;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pn_core::wire::{encode_departure, encode_presence};
use pn_core::{DiscoveryConfig, SelfDescriptor};
use pn_discovery::{Discovery, PeerEvent};

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// `n` distinct loopback UDP ports that were free a moment ago.
/// All probes are held until every port is chosen so none repeats.
pub fn free_ports(n: usize) -> Vec<u16> {
    let probes: Vec<_> = (0..n)
        .map(|_| std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap())
        .collect();
    probes
        .iter()
        .map(|p| p.local_addr().unwrap().port())
        .collect()
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Loopback-only config that unicasts every announcement to `peers`.
/// Announces once a second.
pub fn loopback_config(port: u16, peers: &[u16]) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::with_port(port);
    config.network.bind_addr = Ipv4Addr::LOCALHOST;
    config.network.broadcast = false;
    config.network.static_peers = peers.iter().copied().map(loopback).collect();
    config.network.recv_timeout_ms = 200;
    config.announce.min_interval_secs = 1;
    config.announce.max_interval_secs = 1;
    config
}

/// Must run inside a tokio runtime.
pub fn context(port: u16, peers: &[u16]) -> Result<Discovery> {
    Discovery::init(loopback_config(port, peers))
        .with_context(|| format!("init discovery on 127.0.0.1:{port}"))
}

/// Two contexts that can hear each other.
pub fn pair() -> Result<(Discovery, Discovery)> {
    let ports = free_ports(2);
    let a = context(ports[0], &[ports[1]])?;
    let b = context(ports[1], &[ports[0]])?;
    Ok((a, b))
}

/// Collects callback events for assertions.
pub struct Events {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

/// A callback for `start_listening` and the receiver of what it sees.
pub fn recorder() -> (impl FnMut(PeerEvent) + Send + 'static, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |event: PeerEvent| {
        let _ = tx.send(event);
    };
    (callback, Events { rx })
}

impl Events {
    /// Next event, failing the test if none arrives in time.
    pub async fn next(&mut self) -> PeerEvent {
        timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("no peer event within timeout")
            .expect("listener dropped its callback")
    }

    /// Fail if any event arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = timeout(window, self.rx.recv()).await {
            panic!("unexpected event: {event:?}");
        }
    }
}

/// Hand-built datagrams from a plain socket, for peers that are not
/// `Discovery` contexts.
pub struct RawPeer {
    socket: UdpSocket,
}

impl RawPeer {
    pub async fn new() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self { socket })
    }

    pub async fn send(&self, port: u16, payload: &[u8]) -> Result<()> {
        self.socket.send_to(payload, loopback(port)).await?;
        Ok(())
    }

    pub async fn presence(&self, port: u16, id: &str, service: &str) -> Result<()> {
        let me = SelfDescriptor::new(id, service, "127.0.0.1", 4000, 0, None);
        self.send(port, &encode_presence(&me)?).await
    }

    pub async fn departure(&self, port: u16, id: &str) -> Result<()> {
        let me = SelfDescriptor::new(id, "any", "127.0.0.1", 0, 0, None);
        self.send(port, &encode_departure(&me)?).await
    }
}

//! pn-discovery — Phoenix Nest LAN service discovery.
//!
//! Instances announce themselves with periodic UDP broadcasts and listen for
//! everyone else's. [`Discovery`] owns one socket, the peer registry, and the
//! two background tasks:
//!
//! ```no_run
//! # async fn demo() -> Result<(), pn_discovery::DiscoveryError> {
//! use pn_discovery::{Discovery, DiscoveryConfig};
//!
//! let mut discovery = Discovery::init(DiscoveryConfig::default())?;
//! discovery.start_listening(|event| println!("{event:?}"))?;
//! discovery
//!     .start_announcing("KY4OLB-SDR1", "sdr_server", 4535, 4536, Some("rsp2pro,2mhz"))
//!     .await?;
//!
//! if let Some(peer) = discovery.find_peer_by_type("waterfall") {
//!     println!("waterfall at {}:{}", peer.ip, peer.ctrl_port);
//! }
//!
//! discovery.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod announcer;
pub mod broadcast;
pub mod error;
pub mod listener;
pub mod registry;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;

use pn_core::wire::encode_presence;

pub use error::DiscoveryError;
pub use listener::PeerEvent;
pub use pn_core::{DiscoveryConfig, SelfDescriptor};
pub use registry::{new_registry, PeerRecord, PeerRegistry};

use announcer::Announcer;
use broadcast::BroadcastTransport;
use listener::{Listener, ListenerSettings, OwnIdentities};

/// One discovery endpoint: a bound socket, a registry, and optionally a
/// running announcer and listener.
///
/// Dropping it without [`Discovery::shutdown`] cancels both tasks but does
/// not wait for the departure message to go out.
pub struct Discovery {
    config: DiscoveryConfig,
    runtime: Handle,
    /// `None` once shut down.
    transport: Option<Arc<BroadcastTransport>>,
    registry: PeerRegistry,
    local_ip: Ipv4Addr,
    local_addr: SocketAddr,
    /// Identities this context announces, read by the listener for
    /// self-suppression.
    own: watch::Sender<OwnIdentities>,
    announcer: Option<Announcer>,
    listener: Option<Listener>,
}

impl Discovery {
    /// Bind the discovery socket and resolve the local address.
    /// No task is started.
    ///
    /// Must be called from within a tokio runtime, which later runs the
    /// announcer and listener tasks.
    pub fn init(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;

        let transport = BroadcastTransport::bind(&config)?;
        let local_addr = transport.local_addr();
        let local_ip = match broadcast::resolve_local_address() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(error = %e, "local address unknown, reporting loopback");
                Ipv4Addr::LOCALHOST
            }
        };

        tracing::info!(%local_addr, %local_ip, "discovery initialized");

        let (own, _) = watch::channel(OwnIdentities::default());
        Ok(Self {
            registry: new_registry(config.registry.capacity),
            runtime,
            transport: Some(Arc::new(transport)),
            config,
            local_ip,
            local_addr,
            own,
            announcer: None,
            listener: None,
        })
    }

    /// Begin announcing this instance. An existing session is stopped first,
    /// departure included.
    ///
    /// Strings longer than the wire bounds are truncated.
    pub async fn start_announcing(
        &mut self,
        id: &str,
        service: &str,
        ctrl_port: u16,
        data_port: u16,
        caps: Option<&str>,
    ) -> Result<(), DiscoveryError> {
        let transport = self.live_transport()?;
        if id.is_empty() {
            return Err(DiscoveryError::InvalidDescriptor("identity is empty"));
        }
        if service.is_empty() {
            return Err(DiscoveryError::InvalidDescriptor("service type is empty"));
        }

        let descriptor = SelfDescriptor::new(
            id,
            service,
            &self.local_ip.to_string(),
            ctrl_port,
            data_port,
            caps,
        );
        encode_presence(&descriptor)?;

        self.stop_announcing().await;

        self.own.send_modify(|own| own.announce(descriptor.id.clone()));
        self.announcer = Some(Announcer::spawn(
            &self.runtime,
            transport,
            descriptor,
            self.config.announce_interval(),
        ));
        Ok(())
    }

    /// Stop announcing and wait for the departure message. No-op when idle.
    pub async fn stop_announcing(&mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.stop().await;
        }
        self.own.send_modify(OwnIdentities::retire);
    }

    /// Start the listener. `callback` runs on the listener task for every
    /// [`PeerEvent`]. Calling again while listening keeps the first callback.
    pub fn start_listening<F>(&mut self, callback: F) -> Result<(), DiscoveryError>
    where
        F: FnMut(PeerEvent) + Send + 'static,
    {
        let transport = self.live_transport()?;
        if self.listener.is_some() {
            tracing::debug!("already listening");
            return Ok(());
        }

        let settings = ListenerSettings {
            recv_timeout: self.config.recv_timeout(),
            peer_ttl: self.config.peer_ttl(),
        };
        self.listener = Some(Listener::spawn(
            &self.runtime,
            transport,
            self.registry.clone(),
            self.own.subscribe(),
            settings,
            callback,
        ));
        Ok(())
    }

    pub fn find_peer_by_type(&self, service: &str) -> Option<PeerRecord> {
        self.registry.find_by_type(service)
    }

    pub fn find_peer_by_id(&self, id: &str) -> Option<PeerRecord> {
        self.registry.find_by_id(id)
    }

    pub fn snapshot_peers(&self, max: usize) -> Vec<PeerRecord> {
        self.registry.snapshot(max)
    }

    pub fn peer_count(&self) -> usize {
        self.registry.count()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// The address reported in presence messages.
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// What is being announced right now, as it goes on the wire.
    pub fn announced(&self) -> Option<&SelfDescriptor> {
        self.announcer.as_ref().map(Announcer::descriptor)
    }

    pub fn is_announcing(&self) -> bool {
        self.announcer.is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Stop both tasks and release the socket. Safe to call more than once.
    /// The registry stays queryable.
    pub async fn shutdown(&mut self) {
        self.stop_announcing().await;
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        if self.transport.take().is_some() {
            tracing::info!(local_addr = %self.local_addr, "discovery shut down");
        }
    }

    fn live_transport(&self) -> Result<Arc<BroadcastTransport>, DiscoveryError> {
        self.transport.clone().ok_or(DiscoveryError::ShutDown)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(announcer) = &self.announcer {
            announcer.cancel();
        }
        if let Some(listener) = &self.listener {
            listener.cancel();
        }
    }
}

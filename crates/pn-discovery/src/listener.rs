//! Presence listener.
//!
//! Receives datagrams on the shared socket, decodes them and applies them to
//! the peer registry. The user callback fires only on transitions: a peer
//! appearing, departing, or (with expiry enabled) going stale. Refreshes of
//! a known peer are silent.
//!
//! Datagrams that fail to decode are dropped with a trace log. Anything
//! carrying an identity this context announces, or recently announced, is
//! ignored.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use pn_core::wire::{decode, MAX_MESSAGE_LEN};
use pn_core::{Departure, Message, Presence};

use crate::broadcast::BroadcastTransport;
use crate::registry::{PeerRecord, PeerRegistry, PeerUpdate};

/// How often stale peers are swept when a TTL is configured.
pub const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// A change in the set of known peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// First presence message from an identity not currently known.
    Discovered(PeerRecord),
    /// The peer sent a departure message. Carries its last-known fields.
    Departed(PeerRecord),
    /// No presence message arrived within the configured TTL.
    Expired(PeerRecord),
}

impl PeerEvent {
    pub fn peer(&self) -> &PeerRecord {
        match self {
            PeerEvent::Discovered(p) | PeerEvent::Departed(p) | PeerEvent::Expired(p) => p,
        }
    }

    /// True for both graceful departures and expiry.
    pub fn is_departure(&self) -> bool {
        !matches!(self, PeerEvent::Discovered(_))
    }
}

/// How many retired identities stay suppressed after their session ends.
const RETIRED_LIMIT: usize = 16;

/// Identities this context announces or has announced.
///
/// A session's last presence and its departure can still be queued on the
/// socket when the session ends, so a retired identity keeps being
/// suppressed. The oldest retired identities are forgotten first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnIdentities {
    current: Option<String>,
    retired: VecDeque<String>,
}

impl OwnIdentities {
    /// The identity being announced right now.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current.as_deref() == Some(id) || self.retired.iter().any(|r| r == id)
    }

    /// Start announcing `id`, retiring whatever was announced before.
    pub(crate) fn announce(&mut self, id: String) {
        self.retire();
        self.retired.retain(|r| *r != id);
        self.current = Some(id);
    }

    /// End the current session. Its identity stays suppressed.
    pub(crate) fn retire(&mut self) {
        if let Some(id) = self.current.take() {
            self.retired.retain(|r| *r != id);
            self.retired.push_front(id);
            self.retired.truncate(RETIRED_LIMIT);
        }
    }
}

/// Listener timing.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    /// Upper bound on a single receive wait.
    pub recv_timeout: Duration,
    /// `None` disables expiry.
    pub peer_ttl: Option<Duration>,
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Applies decoded datagrams to the registry and reports transitions.
pub(crate) struct Dispatch<F> {
    registry: PeerRegistry,
    own: watch::Receiver<OwnIdentities>,
    callback: F,
}

impl<F: FnMut(PeerEvent)> Dispatch<F> {
    pub(crate) fn new(
        registry: PeerRegistry,
        own: watch::Receiver<OwnIdentities>,
        callback: F,
    ) -> Self {
        Self {
            registry,
            own,
            callback,
        }
    }

    pub(crate) fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr) {
        let message = match decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::trace!(%source, error = %e, len = bytes.len(), "discarding datagram");
                return;
            }
        };

        if self.is_self(message.id()) {
            tracing::trace!(cmd = message.kind().as_str(), "ignoring own announcement");
            return;
        }

        match message {
            Message::Presence(p) => self.on_presence(p, source),
            Message::Departure(d) => self.on_departure(d),
        }
    }

    /// Sweep records older than `ttl`.
    pub(crate) fn expire(&mut self, ttl: Duration) {
        for record in self.registry.expire(ttl) {
            tracing::info!(id = %record.id, service = %record.service, "peer expired");
            (self.callback)(PeerEvent::Expired(record));
        }
    }

    fn is_self(&self, id: &str) -> bool {
        self.own.borrow().contains(id)
    }

    fn on_presence(&mut self, p: Presence, source: SocketAddr) {
        let update = PeerUpdate {
            ip: p.ip.unwrap_or_else(|| source.ip().to_string()),
            id: p.id,
            service: p.service,
            ctrl_port: p.ctrl_port,
            data_port: p.data_port,
            caps: p.caps,
            sent_at: p.timestamp,
        };

        match self.registry.upsert(&update) {
            Some(done) if done.is_new => {
                tracing::info!(
                    id = %update.id,
                    service = %update.service,
                    ip = %update.ip,
                    port = update.ctrl_port,
                    "peer discovered"
                );
                (self.callback)(PeerEvent::Discovered(update.into_record(done.last_seen)));
            }
            Some(_) => tracing::trace!(id = %update.id, "peer refreshed"),
            None => tracing::debug!(
                id = %update.id,
                capacity = self.registry.capacity(),
                "registry full, new peer dropped"
            ),
        }
    }

    fn on_departure(&mut self, d: Departure) {
        match self.registry.remove(&d.id) {
            Some(record) => {
                tracing::info!(id = %record.id, service = %record.service, "peer departed");
                (self.callback)(PeerEvent::Departed(record));
            }
            None => tracing::trace!(id = %d.id, "departure from unknown peer"),
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// Handle to the running listener task.
pub struct Listener {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn spawn<F>(
        runtime: &Handle,
        transport: Arc<BroadcastTransport>,
        registry: PeerRegistry,
        own: watch::Receiver<OwnIdentities>,
        settings: ListenerSettings,
        callback: F,
    ) -> Self
    where
        F: FnMut(PeerEvent) + Send + 'static,
    {
        let token = CancellationToken::new();
        let dispatch = Dispatch::new(registry, own, callback);
        let task = runtime.spawn(listen_loop(transport, dispatch, settings, token.clone()));
        Self { token, task }
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "listener task ended abnormally");
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

async fn listen_loop<F>(
    transport: Arc<BroadcastTransport>,
    mut dispatch: Dispatch<F>,
    settings: ListenerSettings,
    token: CancellationToken,
) where
    F: FnMut(PeerEvent),
{
    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    let mut sweep = settings.peer_ttl.map(|_| {
        let mut interval = time::interval(EXPIRY_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    tracing::info!(
        addr = %transport.local_addr(),
        ttl_secs = settings.peer_ttl.map(|t| t.as_secs()),
        "listener starting"
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            _ = next_sweep(&mut sweep) => {
                if let Some(ttl) = settings.peer_ttl {
                    dispatch.expire(ttl);
                }
            }

            received = time::timeout(settings.recv_timeout, transport.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, source))) => dispatch.handle_datagram(&buf[..len], source),
                    Ok(Err(e)) => tracing::debug!(error = %e, "recv_from failed"),
                    // Timed out; loop to re-check cancellation.
                    Err(_) => {}
                }
            }
        }
    }

    tracing::info!("listener stopped");
}

/// Next expiry tick, or never when expiry is off.
async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

//! pnd — Phoenix Nest discovery daemon.
//!
//! Announces one service (or none) and logs every peer that comes and goes.
//! Run two on the same LAN to watch them find each other:
//!
//! ```text
//! pnd server KY4OLB-SDR1
//! pnd client WF1
//! ```

use std::time::Duration;

use anyhow::{Context, Result};

use pn_core::wire::service;
use pn_core::DiscoveryConfig;
use pn_discovery::{Discovery, PeerEvent};

const DEFAULT_ID: &str = "TEST1";
const PEER_TABLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Announce as an SDR server with control and data ports.
    Server,
    /// Announce as a waterfall display.
    Client,
    /// Listen only.
    Listen,
}

impl Mode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "server" => Some(Mode::Server),
            "client" => Some(Mode::Client),
            "listen" => Some(Mode::Listen),
            _ => None,
        }
    }
}

fn print_usage() {
    println!("Usage: pnd <mode> [id]");
    println!();
    println!("Modes:");
    println!("  server   Announce as {} on ports 4535/4536", service::SDR_SERVER);
    println!("  client   Announce as {}", service::WATERFALL);
    println!("  listen   Listen only, do not announce");
    println!();
    println!("The identity defaults to {DEFAULT_ID}.");
    println!("Config: {}", DiscoveryConfig::file_path().display());
}

fn log_event(event: &PeerEvent) {
    let peer = event.peer();
    match event {
        PeerEvent::Discovered(_) => tracing::info!(
            id = %peer.id,
            service = %peer.service,
            addr = %format!("{}:{}", peer.ip, peer.ctrl_port),
            data_port = peer.data_port,
            caps = %peer.caps,
            "service found"
        ),
        PeerEvent::Departed(_) => {
            tracing::info!(id = %peer.id, service = %peer.service, "service left")
        }
        PeerEvent::Expired(_) => {
            tracing::info!(id = %peer.id, service = %peer.service, "service timed out")
        }
    }
}

fn log_peer_table(discovery: &Discovery) {
    let peers = discovery.snapshot_peers(discovery.registry().capacity());
    if peers.is_empty() {
        return;
    }
    tracing::info!(count = peers.len(), "known services");
    for peer in &peers {
        tracing::info!(
            id = %peer.id,
            service = %peer.service,
            addr = %format!("{}:{}", peer.ip, peer.ctrl_port),
            seen_secs_ago = peer.last_seen.elapsed().as_secs(),
            "  peer"
        );
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match args.first().map(String::as_str) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            return Ok(());
        }
        Some(m) => match Mode::parse(m) {
            Some(mode) => mode,
            None => {
                eprintln!("Unknown mode: {m}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => {
            print_usage();
            std::process::exit(1);
        }
    };
    let id = args.get(1).map(String::as_str).unwrap_or(DEFAULT_ID);

    if let Err(e) = DiscoveryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DiscoveryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DiscoveryConfig::default()
    });

    let mut discovery = Discovery::init(config).context("failed to initialize discovery")?;

    discovery
        .start_listening(|event| log_event(&event))
        .context("failed to start listener")?;

    let announced = match mode {
        Mode::Server => {
            discovery
                .start_announcing(id, service::SDR_SERVER, 4535, 4536, Some("rsp2pro,2mhz"))
                .await
        }
        Mode::Client => discovery.start_announcing(id, service::WATERFALL, 0, 0, None).await,
        Mode::Listen => Ok(()),
    };
    if let Err(e) = announced {
        discovery.shutdown().await;
        return Err(e).context("failed to start announcing");
    }

    tracing::info!(
        ?mode,
        id,
        local_ip = %discovery.local_ip(),
        addr = %discovery.local_addr(),
        "pnd running, Ctrl-C to exit"
    );

    let mut table = tokio::time::interval(PEER_TABLE_INTERVAL);
    table.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = table.tick() => log_peer_table(&discovery),
        }
    }

    discovery.shutdown().await;
    tracing::info!("pnd stopped");
    Ok(())
}

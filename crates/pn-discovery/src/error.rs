//! Errors surfaced to the caller. Only setup can fail; steady-state
//! anomalies (send failures, malformed datagrams, a full registry) are
//! absorbed by the background tasks.

use std::io;
use std::net::SocketAddr;

use pn_core::{ConfigError, WireError};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to create UDP socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to enable SO_BROADCAST: {0}")]
    Broadcast(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to resolve local address: {0}")]
    LocalAddress(#[source] io::Error),

    #[error("invalid self descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no tokio runtime is running")]
    NoRuntime,

    #[error("discovery context has been shut down")]
    ShutDown,
}

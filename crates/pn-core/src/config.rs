//! Configuration for a discovery context.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/phoenix-nest/discovery.toml
//!   3. ~/.config/phoenix-nest/discovery.toml

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::DEFAULT_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub network: NetworkConfig,
    pub announce: AnnounceConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Discovery port shared by every peer. 0 = 5400.
    pub port: u16,
    /// Local address to bind. Unspecified = all interfaces.
    pub bind_addr: Ipv4Addr,
    /// Fan out to subnet and global broadcast addresses.
    pub broadcast: bool,
    /// Unicast destinations that receive every message in addition to the
    /// broadcast fan-out. Useful where broadcast is filtered.
    pub static_peers: Vec<SocketAddr>,
    /// Upper bound on a single blocking receive, in milliseconds.
    pub recv_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    /// Shortest pause between presence messages, in seconds.
    pub min_interval_secs: u64,
    /// Longest pause between presence messages, in seconds.
    pub max_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Number of peer slots.
    pub capacity: usize,
    /// Expire peers not heard from in this many seconds. 0 = never.
    pub peer_ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            announce: AnnounceConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            broadcast: true,
            static_peers: Vec::new(),
            recv_timeout_ms: 1000,
        }
    }
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            max_interval_secs: 60,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            peer_ttl_secs: 0,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    /// Config with everything default except the port.
    pub fn with_port(port: u16) -> Self {
        let mut config = Self::default();
        config.network.port = port;
        config
    }

    /// The port actually bound and broadcast to.
    pub fn port(&self) -> u16 {
        if self.network.port == 0 {
            DEFAULT_PORT
        } else {
            self.network.port
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.network.recv_timeout_ms.max(1))
    }

    /// Inclusive range the announce jitter is drawn from.
    pub fn announce_interval(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.announce.min_interval_secs),
            Duration::from_secs(self.announce.max_interval_secs),
        )
    }

    /// `None` when expiry is disabled.
    pub fn peer_ttl(&self) -> Option<Duration> {
        match self.registry.peer_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce.min_interval_secs > self.announce.max_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "announce.min_interval_secs ({}) exceeds announce.max_interval_secs ({})",
                self.announce.min_interval_secs, self.announce.max_interval_secs
            )));
        }
        if self.announce.max_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "announce.max_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.registry.capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("phoenix-nest")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            DiscoveryConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("discovery.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DiscoveryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PN_* overrides. `lookup` is `std::env::var` in production.
    /// Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("PN_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(a) = lookup("PN_NETWORK__BIND_ADDR").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = a;
        }
        if let Some(v) = lookup("PN_NETWORK__BROADCAST") {
            self.network.broadcast = v == "true" || v == "1";
        }
        if let Some(v) = lookup("PN_NETWORK__STATIC_PEERS") {
            self.network.static_peers = v
                .split(',')
                .map(str::trim)
                .filter_map(|s| s.parse().ok())
                .collect();
        }
        if let Some(n) = lookup("PN_ANNOUNCE__MIN_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.announce.min_interval_secs = n;
        }
        if let Some(n) = lookup("PN_ANNOUNCE__MAX_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.announce.max_interval_secs = n;
        }
        if let Some(n) = lookup("PN_REGISTRY__CAPACITY").and_then(|v| v.parse().ok()) {
            self.registry.capacity = n;
        }
        if let Some(n) = lookup("PN_REGISTRY__PEER_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.registry.peer_ttl_secs = n;
        }
    }
}

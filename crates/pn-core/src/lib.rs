//! pn-core — wire format, protocol constants and configuration for
//! Phoenix Nest service discovery. All other crates depend on this one.

pub mod config;
pub mod wire;

pub use config::{ConfigError, DiscoveryConfig};
pub use wire::{Departure, Message, MessageKind, Presence, SelfDescriptor, WireError};

//! Platforms without getifaddrs. Sends go to the global broadcast address
//! and static peers only; the local address comes from the routing probe.

use std::io;

use super::Interface;

pub(super) fn interfaces() -> io::Result<Vec<Interface>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration is not available on this platform",
    ))
}

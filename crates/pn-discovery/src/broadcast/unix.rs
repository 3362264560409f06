//! Interface enumeration via getifaddrs(3).

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::SockaddrStorage;

use super::Interface;

/// Every IPv4 address on every local interface. Non-IPv4 entries are skipped.
pub(super) fn interfaces() -> io::Result<Vec<Interface>> {
    let addrs = getifaddrs().map_err(io::Error::from)?;

    Ok(addrs
        .filter_map(|ifa| {
            let addr = ifa.address.as_ref().and_then(ipv4)?;
            let netmask = ifa.netmask.as_ref().and_then(ipv4);
            Some(Interface {
                addr,
                netmask,
                up: ifa.flags.contains(InterfaceFlags::IFF_UP),
                broadcast: ifa.flags.contains(InterfaceFlags::IFF_BROADCAST),
                loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                name: ifa.interface_name,
            })
        })
        .collect())
}

fn ipv4(storage: &SockaddrStorage) -> Option<Ipv4Addr> {
    storage
        .as_sockaddr_in()
        .map(|sin| *SocketAddrV4::from(*sin).ip())
}

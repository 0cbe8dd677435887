//! Local source address discovery.
//!
//! Asks the kernel which local address it would use to reach a target by
//! connecting a UDP socket to it and reading back the bound address. UDP
//! `connect` only performs a route lookup, so nothing is sent; the hop limit
//! is kept minimal regardless.

use crate::error::ResolverError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Default IPv4 discovery target
pub const DEFAULT_V4_TARGET: &str = "10.255.255.255:1";

/// Default IPv6 discovery target
pub const DEFAULT_V6_TARGET: &str = "[fc00::]:1";

/// Default TTL / unicast hop limit for the probe socket
pub const DEFAULT_HOP_LIMIT: u32 = 1;

/// Local address the OS would use to reach `target`
///
/// # Errors
///
/// Returns [`ResolverError::Probe`] if the socket cannot be created or the
/// family has no route to `target` (for example, no IPv6 configured).
pub fn probe_local_address(target: SocketAddr, hop_limit: u32) -> Result<IpAddr, ResolverError> {
    let probe = |source| ResolverError::Probe { target, source };

    let socket =
        Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP)).map_err(probe)?;
    if target.is_ipv6() {
        socket.set_only_v6(true).map_err(probe)?;
        socket.set_unicast_hops_v6(hop_limit).map_err(probe)?;
    }

    let socket: UdpSocket = socket.into();
    if target.is_ipv4() {
        socket.set_ttl(hop_limit).map_err(probe)?;
    }
    socket.connect(target).map_err(probe)?;

    let local = socket.local_addr().map_err(probe)?;
    tracing::trace!(%target, local = %local.ip(), "probed local address");
    Ok(local.ip())
}

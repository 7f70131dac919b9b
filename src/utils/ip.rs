//! IP address classification helpers.
//!
//! Hunting tasks are only issued for (and traces only report) addresses
//! that are meaningful outside the local network. Anything private,
//! link-local or otherwise non-routable is filtered here.

use std::net::{IpAddr, Ipv6Addr};

/// True when `ip` is a globally routable unicast address.
///
/// Observers behind NAT or on link-local addresses produce traces that
/// cannot be correlated across the network, so no hunting task is issued
/// for them.
pub fn is_public_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || is_scoped_v6(v6))
        }
    }
}

/// True when `ip` must be stripped from a traceroute before it leaves the
/// local machine: RFC-1918 ranges, 169.254/16, loopback, IPv6 unique-local
/// (fc00::/7) and the fe80..feff scoped block.
pub fn is_private_for_trace(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_scoped_v6(v6),
    }
}

// fc00::/7 (unique local) plus fe80::/9 (link/site local, historically the
// whole fe80..feff block is treated as non-routable here).
fn is_scoped_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.octets()[0];
    let second = v6.octets()[1];
    first == 0xfc || first == 0xfd || (first == 0xfe && second >= 0x80)
}

/// Parse a textual hop emitted by a tracer. Accepts only literal IPv4 or
/// IPv6 addresses, never hostnames.
pub fn parse_hop(token: &str) -> Option<IpAddr> {
    token.parse::<IpAddr>().ok()
}

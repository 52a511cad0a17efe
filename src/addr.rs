// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Family-agnostic address helpers used by the transport layer to pick a
//! socket domain, and by the engine before acting on network-change
//! notifications.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family, used to pick the socket domain before a name is even
/// resolved (e.g. when the user pins `--family inet6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    pub fn domain(self) -> socket2::Domain {
        match self {
            Family::Inet => socket2::Domain::IPV4,
            Family::Inet6 => socket2::Domain::IPV6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet => write!(f, "inet"),
            Family::Inet6 => write!(f, "inet6"),
        }
    }
}

/// An IPv4 network in CIDR notation, used to recognize loopback/link-local
/// ranges the network-change watcher should ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    addr: Ipv4Addr,
    prefix_len: u8,
    mask: u32,
}

impl Ipv4Network {
    /// # Panics
    /// Panics if `prefix_len` > 32.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        assert!(prefix_len <= 32, "prefix_len must be <= 32");
        let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
        let network_addr = Ipv4Addr::from(u32::from(addr) & mask);
        Self { addr: network_addr, prefix_len, mask }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask == u32::from(self.addr)
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Loopback/link-local ranges. The engine checks this before reacting to a
/// network-change notification, so a flapping local-only route doesn't
/// trigger a reconnect of a connection whose peer is itself loopback or
/// link-local.
pub fn is_loopback_or_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback() || Ipv4Network::new(Ipv4Addr::new(169, 254, 0, 0), 16).contains(*v4)
        }
        IpAddr::V6(v6) => v6.is_loopback() || is_unicast_link_local(v6),
    }
}

fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Pretty-print a `SocketAddr`, bracketing IPv6 the way collector addresses
/// are shown in logs (`[::1]:9514` vs `127.0.0.1:9514`).
pub fn display_socket_addr(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_matches_address() {
        assert_eq!(Family::of(&"127.0.0.1".parse().unwrap()), Family::Inet);
        assert_eq!(Family::of(&"::1".parse().unwrap()), Family::Inet6);
    }

    #[test]
    fn ipv4_network_contains() {
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 8);
        assert!(net.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn link_local_v4_detected() {
        assert!(is_loopback_or_link_local(&"169.254.1.1".parse().unwrap()));
        assert!(is_loopback_or_link_local(&"127.0.0.1".parse().unwrap()));
        assert!(!is_loopback_or_link_local(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn link_local_v6_detected() {
        assert!(is_loopback_or_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_loopback_or_link_local(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn display_brackets_v6() {
        let v4: SocketAddr = "127.0.0.1:9514".parse().unwrap();
        let v6: SocketAddr = "[::1]:9514".parse().unwrap();
        assert_eq!(display_socket_addr(v4), "127.0.0.1:9514");
        assert_eq!(display_socket_addr(v6), "[::1]:9514");
    }
}

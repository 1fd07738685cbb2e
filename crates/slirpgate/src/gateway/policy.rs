//! Routing policy: decides which client addresses may be preserved
//! (spoofed) on the far side of the gateway.
//!
//! The policy holds two ordered CIDR lists:
//!
//! - `deny`: reserved and non-routable ranges. A match here always wins.
//! - `allow`: a catch-all (`0.0.0.0/0`, `::/0`) kept for future narrowing;
//!   it is never consulted ahead of `deny`.
//!
//! The same check serves two callers with different consequences: an
//! address observed on an accepted socket that fails is simply not spoofed,
//! while an address *declared* in a PROXY preamble that fails aborts the
//! session (see [`RoutingPolicy::check_declared`]).

use crate::error::{GatewayError, GatewayResult};
use ipnet::IpNet;
use std::net::IpAddr;

/// Reserved ranges that must never be used as a spoofed source.
///
/// RFC1918 space is deliberately absent: a private client is still a real
/// client worth preserving.
const RESERVED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "::/96",
    "::ffff:0:0:0/96",
    "64:ff9b::/96",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
    "fec0::/10",
];

/// Built-in deny list.
pub fn default_deny() -> Vec<IpNet> {
    // Well-known literals; a parse failure would be a typo in the table above.
    RESERVED_RANGES
        .iter()
        .filter_map(|s| s.parse::<IpNet>().ok())
        .collect()
}

/// Built-in allow list: everything.
pub fn default_allow() -> Vec<IpNet> {
    ["0.0.0.0/0", "::/0"]
        .iter()
        .filter_map(|s| s.parse::<IpNet>().ok())
        .collect()
}

/// Immutable deny/allow routing tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    deny: Vec<IpNet>,
    allow: Vec<IpNet>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::new(default_deny(), default_allow())
    }
}

impl RoutingPolicy {
    pub fn new(deny: Vec<IpNet>, allow: Vec<IpNet>) -> Self {
        Self { deny, allow }
    }

    /// `false` if `addr` falls in any deny prefix, `true` otherwise.
    ///
    /// IPv4-mapped IPv6 addresses are matched in their IPv4 form, so
    /// `::ffff:127.0.0.1` is as loopback as `127.0.0.1`.
    pub fn is_spoofable(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        !self.deny.iter().any(|net| net.contains(&addr))
    }

    /// Validate an address a PROXY preamble claims as the client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RoutingDenied`] if the address is not
    /// spoofable.
    pub fn check_declared(&self, addr: IpAddr) -> GatewayResult<()> {
        if self.is_spoofable(addr) {
            Ok(())
        } else {
            Err(GatewayError::RoutingDenied { addr })
        }
    }

    pub fn deny(&self) -> &[IpNet] {
        &self.deny
    }

    pub fn allow(&self) -> &[IpNet] {
        &self.allow
    }
}

fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

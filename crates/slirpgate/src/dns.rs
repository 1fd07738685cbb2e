//! Nameservers for the guest, read from the host's `resolv.conf`.
//!
//! Only `nameserver` lines carrying a literal IP are honoured, capped at the
//! conventional three; everything else is flagged as unknown and ignored.
//! When nothing usable is found the loopback resolvers are used.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{debug, warn};

/// Standard resolver limit (`MAXNS`).
const MAX_NAMESERVERS: usize = 3;

const DEFAULT_NAMESERVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
];

/// Parsed resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    pub servers: Vec<IpAddr>,
    /// An unrecognised directive was seen.
    pub unknown_opt: bool,
    /// Error from opening the file, if any.
    pub error: Option<String>,
}

/// Read and parse `path`, falling back to loopback resolvers.
pub fn read_resolv_conf(path: &Path) -> DnsConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_resolv_conf(&content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read resolv.conf, using defaults");
            DnsConfig {
                servers: DEFAULT_NAMESERVERS.to_vec(),
                unknown_opt: false,
                error: Some(e.to_string()),
            }
        }
    }
}

pub fn parse_resolv_conf(content: &str) -> DnsConfig {
    let mut servers = Vec::new();
    let mut unknown_opt = false;

    for line in content.lines() {
        if line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            None => continue,
            Some("nameserver") => {
                if servers.len() >= MAX_NAMESERVERS {
                    continue;
                }
                // Hostnames would need DNS to resolve; skip them.
                if let Some(ip) = fields.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                    servers.push(ip);
                }
            }
            Some(other) => {
                debug!(directive = other, "ignoring resolv.conf directive");
                unknown_opt = true;
            }
        }
    }

    if servers.is_empty() {
        servers = DEFAULT_NAMESERVERS.to_vec();
    }

    DnsConfig {
        servers,
        unknown_opt,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nameservers() {
        let conf = parse_resolv_conf(
            "# generated\n\
             ; comment\n\
             nameserver 192.0.2.53\n\
             nameserver dns.example.com\n\
             nameserver 2001:db8::53\n\
             \n\
             nameserver 198.51.100.53\n\
             nameserver 203.0.113.53\n",
        );
        let expected: Vec<IpAddr> = vec![
            "192.0.2.53".parse().unwrap(),
            "2001:db8::53".parse().unwrap(),
            "198.51.100.53".parse().unwrap(),
        ];
        assert_eq!(conf.servers, expected);
        assert!(!conf.unknown_opt);
    }

    #[test]
    fn test_unknown_options_and_fallback() {
        let conf = parse_resolv_conf("search example.com\noptions ndots:5\n");
        assert!(conf.unknown_opt);
        assert_eq!(conf.servers, DEFAULT_NAMESERVERS.to_vec());
    }

    #[test]
    fn test_missing_file() {
        let conf = read_resolv_conf(Path::new("/nonexistent/resolv.conf"));
        assert!(conf.error.is_some());
        assert_eq!(conf.servers, DEFAULT_NAMESERVERS.to_vec());
    }
}

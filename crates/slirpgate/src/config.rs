//! Gateway configuration: TOML file + CLI overrides.
//!
//! Forward rules come from `[[local_forward]]` / `[[remote_forward]]` tables
//! in the config file and from `-L` / `-R` rule strings on the command line:
//!
//! ```text
//! <scheme>://[bind_ip:]bind_port:[target_ip:]target_port
//! ```
//!
//! | Scheme   | Transport | Preamble | Keep-alive                 |
//! |----------|-----------|----------|----------------------------|
//! | `tcp`    | TCP       | none     | off                        |
//! | `tcppp`  | TCP       | PP v1    | off                        |
//! | `udp`    | UDP       | none     | off                        |
//! | `udpspp` | UDP       | SPP      | off                        |
//! | `udprpc` | UDP       | none     | on, zero interval (1 reply)|
//!
//! IPv6 addresses go in brackets. Omitted addresses are filled from the
//! direction's [`RuleDefaults`].

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::policy::{default_allow, default_deny};
use ipnet::IpNet;
use serde::Deserialize;
use slirpgate_core::Transport;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Addresses used when a rule leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleDefaults {
    pub bind: IpAddr,
    pub target: IpAddr,
}

/// Local forwards listen on host loopback and reach the guest.
pub const LOCAL_DEFAULTS: RuleDefaults = RuleDefaults {
    bind: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
    target: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 100)),
};

/// Remote forwards listen on the gateway's guest-side address and reach
/// host loopback.
pub const REMOTE_DEFAULTS: RuleDefaults = RuleDefaults {
    bind: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)),
    target: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
};

/// UDP keep-alive parameters of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAlive {
    pub enabled: bool,
    pub interval: Duration,
}

impl KeepAlive {
    /// Enabled with a zero interval means a UDP conversation ends after the
    /// first reply is relayed back.
    pub fn close_on_write(&self) -> bool {
        self.enabled && self.interval.is_zero()
    }

    /// Enabled with a nonzero interval: how long a session may stay silent.
    /// UDP sessions are torn down after it; TCP sockets get kernel keepalive.
    pub fn period(&self) -> Option<Duration> {
        (self.enabled && !self.interval.is_zero()).then_some(self.interval)
    }
}

/// One configured forwarding intent. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub transport: Transport,
    /// Where to listen, on whichever side is local for this rule.
    pub bind: SocketAddr,
    /// Where to dial on the opposite side. Port 0 means "resolve per session".
    pub target: SocketAddr,
    pub proxy_protocol: bool,
    pub keep_alive: KeepAlive,
}

impl ForwardRule {
    /// Parse a rule string, filling omitted addresses from `defaults`.
    pub fn parse(spec: &str, defaults: RuleDefaults) -> GatewayResult<Self> {
        let invalid = |reason: String| GatewayError::InvalidRule {
            rule: spec.to_string(),
            reason,
        };

        let (scheme, rest) = spec.split_once("://").unwrap_or(("tcp", spec));
        let (transport, proxy_protocol, keep_alive) = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => (Transport::Tcp, false, KeepAlive::default()),
            "tcppp" => (Transport::Tcp, true, KeepAlive::default()),
            "udp" => (Transport::Udp, false, KeepAlive::default()),
            "udpspp" => (Transport::Udp, true, KeepAlive::default()),
            "udprpc" => (
                Transport::Udp,
                false,
                KeepAlive {
                    enabled: true,
                    interval: Duration::ZERO,
                },
            ),
            other => return Err(invalid(format!("unknown scheme {other:?}"))),
        };

        let fields = split_fields(rest).map_err(invalid)?;
        let (bind_ip, bind_port, target_ip, target_port) = match fields.as_slice() {
            [bp, tp] => (None, bp, None, tp),
            [a, b, c] if a.parse::<IpAddr>().is_ok() => (Some(a), b, None, c),
            [a, b, c] => (None, a, Some(b), c),
            [a, b, c, d] => (Some(a), b, Some(c), d),
            _ => return Err(invalid(format!("expected 2 to 4 fields, got {}", fields.len()))),
        };

        let ip = |s: Option<&String>, default: IpAddr| -> GatewayResult<IpAddr> {
            match s {
                Some(s) => s
                    .parse()
                    .map_err(|_| invalid(format!("invalid address {s:?}"))),
                None => Ok(default),
            }
        };
        let port = |s: &String| -> GatewayResult<u16> {
            s.parse().map_err(|_| invalid(format!("invalid port {s:?}")))
        };

        Ok(Self {
            transport,
            bind: SocketAddr::new(ip(bind_ip, defaults.bind)?, port(bind_port)?),
            target: SocketAddr::new(ip(target_ip, defaults.target)?, port(target_port)?),
            proxy_protocol,
            keep_alive,
        })
    }

    /// Registry key: the textual form of the bound address.
    pub fn bind_key(&self) -> String {
        self.bind.to_string()
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{} -> {}", self.transport, self.bind, self.target)?;
        if self.proxy_protocol {
            f.write_str(" (proxy-protocol)")?;
        }
        Ok(())
    }
}

/// Split `a:b:[v6]:d` into fields, honouring brackets around IPv6 literals.
fn split_fields(s: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or("unterminated '['")?;
            fields.push(after[..close].to_string());
            rest = &after[close + 1..];
            if !rest.is_empty() {
                rest = rest
                    .strip_prefix(':')
                    .ok_or_else(|| "expected ':' after ']'".to_string())?;
            }
        } else if let Some((field, tail)) = rest.split_once(':') {
            fields.push(field.to_string());
            rest = tail;
        } else {
            fields.push(rest.to_string());
            rest = "";
        }
    }
    Ok(fields)
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub local_forward: Vec<RuleSection>,
    #[serde(default)]
    pub remote_forward: Vec<RuleSection>,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub quiet: bool,
    /// Replaces the built-in deny list when present.
    pub routing_deny: Option<Vec<IpNet>>,
    /// Replaces the built-in catch-all allow list when present.
    pub routing_allow: Option<Vec<IpNet>>,
    pub resolv_conf: Option<String>,
}

/// `[[local_forward]]` / `[[remote_forward]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    pub transport: Transport,
    pub bind_addr: Option<IpAddr>,
    pub bind_port: u16,
    pub target_addr: Option<IpAddr>,
    pub target_port: u16,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub keep_alive_enabled: bool,
    /// Seconds.
    #[serde(default)]
    pub keep_alive_interval: u64,
}

impl RuleSection {
    fn into_rule(self, defaults: RuleDefaults) -> ForwardRule {
        ForwardRule {
            transport: self.transport,
            bind: SocketAddr::new(self.bind_addr.unwrap_or(defaults.bind), self.bind_port),
            target: SocketAddr::new(
                self.target_addr.unwrap_or(defaults.target),
                self.target_port,
            ),
            proxy_protocol: self.proxy_protocol,
            keep_alive: KeepAlive {
                enabled: self.keep_alive_enabled,
                interval: Duration::from_secs(self.keep_alive_interval),
            },
        }
    }
}

/// Command-line values layered over the config file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliOverrides<'a> {
    pub local: &'a [String],
    pub remote: &'a [String],
    pub quiet: bool,
    pub resolv_conf: Option<&'a str>,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub quiet: bool,
    pub routing_deny: Vec<IpNet>,
    pub routing_allow: Vec<IpNet>,
    pub resolv_conf: PathBuf,
    pub local_forwards: Vec<ForwardRule>,
    pub remote_forwards: Vec<ForwardRule>,
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides. CLI rules are
    /// appended after the file's rules.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides<'_>) -> GatewayResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let mut local_forwards: Vec<ForwardRule> = file_config
            .local_forward
            .into_iter()
            .map(|r| r.into_rule(LOCAL_DEFAULTS))
            .collect();
        for spec in cli.local {
            local_forwards.push(ForwardRule::parse(spec, LOCAL_DEFAULTS)?);
        }

        let mut remote_forwards: Vec<ForwardRule> = file_config
            .remote_forward
            .into_iter()
            .map(|r| r.into_rule(REMOTE_DEFAULTS))
            .collect();
        for spec in cli.remote {
            remote_forwards.push(ForwardRule::parse(spec, REMOTE_DEFAULTS)?);
        }

        let resolv_conf = cli
            .resolv_conf
            .map(|s| s.to_string())
            .or(file_config.gateway.resolv_conf)
            .unwrap_or_else(|| "/etc/resolv.conf".to_string());

        Ok(Self {
            quiet: cli.quiet || file_config.gateway.quiet,
            routing_deny: file_config.gateway.routing_deny.unwrap_or_else(default_deny),
            routing_allow: file_config
                .gateway
                .routing_allow
                .unwrap_or_else(default_allow),
            resolv_conf: expand_tilde_str(&resolv_conf),
            local_forwards,
            remote_forwards,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_full_rule() {
        let rule = ForwardRule::parse("tcp://0.0.0.0:8080:10.0.2.100:80", LOCAL_DEFAULTS).unwrap();
        assert_eq!(rule.transport, Transport::Tcp);
        assert_eq!(rule.bind, addr("0.0.0.0:8080"));
        assert_eq!(rule.target, addr("10.0.2.100:80"));
        assert!(!rule.proxy_protocol);
        assert_eq!(rule.bind_key(), "0.0.0.0:8080");
    }

    #[test]
    fn test_parse_defaults_fill_addresses() {
        let rule = ForwardRule::parse("8080:80", LOCAL_DEFAULTS).unwrap();
        assert_eq!(rule.bind, addr("127.0.0.1:8080"));
        assert_eq!(rule.target, addr("10.0.2.100:80"));

        let rule = ForwardRule::parse("udp://53:192.0.2.53:53", REMOTE_DEFAULTS).unwrap();
        assert_eq!(rule.transport, Transport::Udp);
        assert_eq!(rule.bind, addr("10.0.2.2:53"));
        assert_eq!(rule.target, addr("192.0.2.53:53"));

        let rule = ForwardRule::parse("tcp://0.0.0.0:2222:22", LOCAL_DEFAULTS).unwrap();
        assert_eq!(rule.bind, addr("0.0.0.0:2222"));
        assert_eq!(rule.target, addr("10.0.2.100:22"));
    }

    #[test]
    fn test_parse_ipv6_and_schemes() {
        let rule = ForwardRule::parse("tcppp://[::]:443:[2001:2::100]:0", LOCAL_DEFAULTS).unwrap();
        assert!(rule.proxy_protocol);
        assert_eq!(rule.bind, addr("[::]:443"));
        assert_eq!(rule.target, addr("[2001:2::100]:0"));

        let rule = ForwardRule::parse("udpspp://5353:53", LOCAL_DEFAULTS).unwrap();
        assert_eq!(rule.transport, Transport::Udp);
        assert!(rule.proxy_protocol);
        assert!(!rule.keep_alive.close_on_write());

        let rule = ForwardRule::parse("udprpc://5353:53", LOCAL_DEFAULTS).unwrap();
        assert!(rule.keep_alive.close_on_write());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ForwardRule::parse("sctp://1:2", LOCAL_DEFAULTS).is_err());
        assert!(ForwardRule::parse("tcp://8080", LOCAL_DEFAULTS).is_err());
        assert!(ForwardRule::parse("tcp://a:b:c:d:e", LOCAL_DEFAULTS).is_err());
        assert!(ForwardRule::parse("tcp://[::1:80:90", LOCAL_DEFAULTS).is_err());
        assert!(ForwardRule::parse("tcp://99999:80", LOCAL_DEFAULTS).is_err());
    }

    #[test]
    fn test_keep_alive_close_on_write() {
        assert!(!KeepAlive::default().close_on_write());
        let ka = KeepAlive {
            enabled: true,
            interval: Duration::from_secs(30),
        };
        assert!(!ka.close_on_write());
    }

    #[test]
    fn test_keep_alive_period() {
        assert_eq!(KeepAlive::default().period(), None);
        let rpc = KeepAlive {
            enabled: true,
            interval: Duration::ZERO,
        };
        assert_eq!(rpc.period(), None);
        let off = KeepAlive {
            enabled: false,
            interval: Duration::from_secs(30),
        };
        assert_eq!(off.period(), None);
        let on = KeepAlive {
            enabled: true,
            interval: Duration::from_secs(30),
        };
        assert_eq!(on.period(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_load_file_and_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
quiet = true
routing_deny = ["127.0.0.0/8"]

[[local_forward]]
transport = "udp"
bind_port = 5353
target_port = 53
keep_alive_enabled = true

[[remote_forward]]
transport = "tcp"
bind_port = 80
target_addr = "192.0.2.10"
target_port = 8080
proxy_protocol = true
"#,
        )
        .unwrap();

        let local = vec!["tcp://2222:22".to_string()];
        let cfg = GatewayConfig::load(
            Some(&path),
            CliOverrides {
                local: &local,
                resolv_conf: Some("/tmp/resolv.conf"),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(cfg.quiet);
        assert_eq!(cfg.routing_deny, vec!["127.0.0.0/8".parse::<IpNet>().unwrap()]);
        assert_eq!(cfg.routing_allow, default_allow());
        assert_eq!(cfg.resolv_conf, PathBuf::from("/tmp/resolv.conf"));

        assert_eq!(cfg.local_forwards.len(), 2);
        assert_eq!(cfg.local_forwards[0].transport, Transport::Udp);
        assert_eq!(cfg.local_forwards[0].bind, addr("127.0.0.1:5353"));
        assert!(cfg.local_forwards[0].keep_alive.close_on_write());
        assert_eq!(cfg.local_forwards[1].target, addr("10.0.2.100:22"));

        assert_eq!(cfg.remote_forwards.len(), 1);
        assert_eq!(cfg.remote_forwards[0].bind, addr("10.0.2.2:80"));
        assert_eq!(cfg.remote_forwards[0].target, addr("192.0.2.10:8080"));
        assert!(cfg.remote_forwards[0].proxy_protocol);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let cfg = GatewayConfig::load(
            Some(Path::new("/nonexistent/slirpgate.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert!(!cfg.quiet);
        assert_eq!(cfg.routing_deny, default_deny());
        assert!(cfg.local_forwards.is_empty());
        assert_eq!(cfg.resolv_conf, PathBuf::from("/etc/resolv.conf"));
    }

    #[test]
    fn test_load_bad_cli_rule() {
        let remote = vec!["bogus://1:2".to_string()];
        let err = GatewayConfig::load(
            None,
            CliOverrides {
                remote: &remote,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRule { .. }));
    }
}

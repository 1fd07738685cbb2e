//! Process-wide gateway state, built once at startup and shared read-only.

use crate::config::{ForwardRule, GatewayConfig};
use crate::dns::DnsConfig;
use crate::gateway::policy::RoutingPolicy;
use slirpgate_core::Transport;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Routing tables and remote-forward registries.
///
/// Nothing here is mutated after [`GatewayState::new`], so sessions read it
/// through an `Arc` without locking.
#[derive(Debug, Default)]
pub struct GatewayState {
    pub routing: RoutingPolicy,
    /// Emit per-connection log lines.
    pub log_connections: bool,
    /// Nameservers advertised to the guest.
    pub dns_servers: Vec<IpAddr>,
    pub(crate) remote_tcp: HashMap<String, Arc<ForwardRule>>,
    pub(crate) remote_udp: HashMap<String, Arc<ForwardRule>>,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig, dns: &DnsConfig) -> Self {
        let mut state = Self {
            routing: RoutingPolicy::new(config.routing_deny.clone(), config.routing_allow.clone()),
            log_connections: !config.quiet,
            dns_servers: dns.servers.clone(),
            remote_tcp: HashMap::new(),
            remote_udp: HashMap::new(),
        };
        for rule in &config.remote_forwards {
            state.register_remote(rule.clone());
        }
        state
    }

    /// Register a remote-forward rule under its bind address. Later rules
    /// for the same address replace earlier ones.
    pub fn register_remote(&mut self, rule: ForwardRule) {
        let registry = match rule.transport {
            Transport::Tcp => &mut self.remote_tcp,
            Transport::Udp => &mut self.remote_udp,
        };
        registry.insert(rule.bind_key(), Arc::new(rule));
    }

    /// Look up the remote-forward rule for a connection the guest opened
    /// towards `bound`.
    pub fn remote_rule(&self, transport: Transport, bound: SocketAddr) -> Option<Arc<ForwardRule>> {
        let registry = match transport {
            Transport::Tcp => &self.remote_tcp,
            Transport::Udp => &self.remote_udp,
        };
        registry.get(&bound.to_string()).cloned()
    }

    /// Number of registered remote forwards (TCP, UDP).
    pub fn remote_counts(&self) -> (usize, usize) {
        (self.remote_tcp.len(), self.remote_udp.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, REMOTE_DEFAULTS};
    use crate::dns::parse_resolv_conf;

    #[test]
    fn test_remote_registries_are_disjoint() {
        let remote = vec!["tcp://80:8080".to_string(), "udp://53:5353".to_string()];
        let config = GatewayConfig::load(
            None,
            CliOverrides {
                remote: &remote,
                quiet: true,
                ..Default::default()
            },
        )
        .unwrap();
        let state = GatewayState::new(&config, &parse_resolv_conf("nameserver 192.0.2.53\n"));

        assert!(!state.log_connections);
        assert_eq!(state.dns_servers, vec!["192.0.2.53".parse::<IpAddr>().unwrap()]);
        assert_eq!(state.remote_counts(), (1, 1));

        let tcp_bound: SocketAddr = "10.0.2.2:80".parse().unwrap();
        let rule = state.remote_rule(Transport::Tcp, tcp_bound).unwrap();
        assert_eq!(rule.target, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert!(state.remote_rule(Transport::Udp, tcp_bound).is_none());

        let udp_bound: SocketAddr = "10.0.2.2:53".parse().unwrap();
        assert!(state.remote_rule(Transport::Udp, udp_bound).is_some());
        assert!(state.remote_rule(Transport::Tcp, udp_bound).is_none());
    }

    #[test]
    fn test_register_replaces_same_bind() {
        let mut state = GatewayState::default();
        state.register_remote(ForwardRule::parse("tcp://80:8080", REMOTE_DEFAULTS).unwrap());
        state.register_remote(ForwardRule::parse("tcp://80:9090", REMOTE_DEFAULTS).unwrap());
        assert_eq!(state.remote_counts(), (1, 0));
        let rule = state
            .remote_rule(Transport::Tcp, "10.0.2.2:80".parse().unwrap())
            .unwrap();
        assert_eq!(rule.target.port(), 9090);
    }
}

//! Remote forwards: connections the guest opens towards a registered bind
//! address are forwarded out to the host network.
//!
//! The guest-side stack owns accepting; it calls
//! [`RemoteForwarder::handle_incoming`] for every new connection or UDP
//! conversation and the matching rule decides where it goes.

use super::forwarder::{Direction, Forwarder};
use super::stack::Dialer;
use crate::error::ProxyError;
use crate::state::GatewayState;
use slirpgate_core::{Duplex, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for guest-initiated connections.
pub struct RemoteForwarder {
    state: Arc<GatewayState>,
    forwarder: Forwarder,
}

impl RemoteForwarder {
    /// `host` dials the host-side targets of remote-forward rules.
    pub fn new(state: Arc<GatewayState>, host: Arc<dyn Dialer>) -> Self {
        let forwarder = Forwarder::new(state.clone(), host, Direction::Remote);
        Self { state, forwarder }
    }

    /// Route one incoming connection by the address the guest connected to.
    ///
    /// Returns `None` when no rule is registered for `bound`; the endpoint
    /// is reset and dropped. Otherwise runs the session to completion.
    pub async fn handle_incoming(
        &self,
        transport: Transport,
        bound: SocketAddr,
        mut conn: Box<dyn Duplex>,
        prefetched: Option<Vec<u8>>,
    ) -> Option<ProxyError> {
        let Some(rule) = self.state.remote_rule(transport, bound) else {
            warn!(transport = %transport, bound = %bound, "no remote forward registered, refusing");
            if let Err(e) = conn.set_reset_on_close() {
                debug!(error = %e, "cannot arm reset on close");
            }
            return None;
        };

        if let Some(first) = prefetched.as_ref() {
            debug!(bound = %bound, len = first.len(), "incoming with prefetched data");
        }
        Some(
            self.forwarder
                .forward(conn, rule.target, rule.proxy_protocol, prefetched)
                .await,
        )
    }
}

//! One forwarded session, end to end.
//!
//! [`Forwarder::forward`] takes an accepted endpoint and walks it through a
//! fixed sequence of fallible steps. The first failing step aborts the
//! session and is recorded as the [`Leg`] of the returned [`ProxyError`]:
//!
//! 1. `local-read`: with a PROXY preamble expected and nothing prefetched,
//!    one bounded probe read from the client.
//! 2. `preamble`: decode PP (TCP) or SPP (UDP) from the buffered bytes.
//! 3. `routing-policy`: a declared client address must be spoofable.
//! 4. `dial`: open the far side, presenting the selected source. On failure
//!    the client is reset rather than closed gracefully.
//! 5. `splice`: relay until done.

use super::policy::RoutingPolicy;
use super::splice::splice;
use super::stack::Dialer;
use crate::error::{GatewayError, GatewayResult, Leg, ProxyError, SpliceSide};
use crate::state::GatewayState;
use slirpgate_core::proxy_protocol::PP_PROBE_SIZE;
use slirpgate_core::{decode_pp, decode_spp, Duplex, Transport};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Which way a session crosses the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host client into the guest.
    Local,
    /// Guest client out to the host network.
    Remote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Local => f.write_str("local-fwd"),
            Direction::Remote => f.write_str("remote-fwd"),
        }
    }
}

/// Addressing decided before the dial.
#[derive(Debug)]
struct Session {
    source: Option<SocketAddr>,
    target: SocketAddr,
    /// Bytes already taken from the client that the far side must see
    /// first. For SPP this still starts with the raw header.
    pending: Vec<u8>,
    /// `pending` is a whole datagram and goes out even when empty.
    datagram: bool,
}

/// Runs forwarded sessions through a [`Dialer`].
pub struct Forwarder {
    state: Arc<GatewayState>,
    dialer: Arc<dyn Dialer>,
    direction: Direction,
}

impl Forwarder {
    pub fn new(state: Arc<GatewayState>, dialer: Arc<dyn Dialer>, direction: Direction) -> Self {
        Self {
            state,
            dialer,
            direction,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Forward one accepted endpoint to `target`.
    ///
    /// # Arguments
    ///
    /// * `local` - The accepted endpoint.
    /// * `target` - Rule target. Port 0 resolves to the declared destination
    ///   port, or else to `local`'s own port.
    /// * `proxy_protocol` - Whether the client opens with a PROXY preamble.
    /// * `prefetched` - Bytes the caller already read from `local`, such as
    ///   the datagram that revealed a new UDP peer.
    pub async fn forward(
        &self,
        mut local: Box<dyn Duplex>,
        target: SocketAddr,
        proxy_protocol: bool,
        prefetched: Option<Vec<u8>>,
    ) -> ProxyError {
        let transport = local.transport();
        let peer = local.peer_addr().ok();
        let bound = local.local_addr().ok();

        let prepared = self
            .prepare(&mut local, target, proxy_protocol, prefetched)
            .await;
        let (resolved, outcome) = match prepared {
            Ok(session) => {
                if self.state.log_connections {
                    info!(
                        direction = %self.direction,
                        transport = %transport,
                        peer = ?peer,
                        local = ?bound,
                        source = ?session.source,
                        target = %session.target,
                        pp = proxy_protocol,
                        "session opened"
                    );
                }
                (Some(session.target), self.connect(local, session).await)
            }
            // Dropping `local` closes it; nothing was dialed.
            Err(pe) => (None, pe),
        };

        if self.state.log_connections {
            let target = resolved.unwrap_or(target);
            if outcome.is_err() {
                warn!(
                    direction = %self.direction,
                    transport = %transport,
                    peer = ?peer,
                    local = ?bound,
                    target = %target,
                    pp = proxy_protocol,
                    outcome = %outcome,
                    "session failed"
                );
            } else {
                info!(
                    direction = %self.direction,
                    transport = %transport,
                    peer = ?peer,
                    local = ?bound,
                    target = %target,
                    pp = proxy_protocol,
                    "session closed"
                );
            }
        }
        outcome
    }

    async fn prepare(
        &self,
        local: &mut Box<dyn Duplex>,
        target: SocketAddr,
        proxy_protocol: bool,
        prefetched: Option<Vec<u8>>,
    ) -> Result<Session, ProxyError> {
        let read_failed = |e: io::Error| ProxyError::failed(Leg::LocalRead, e.into());
        let transport = local.transport();
        let bound = local.local_addr().map_err(read_failed)?;
        let peer = local.peer_addr().map_err(read_failed)?;

        let datagram = transport == Transport::Udp && prefetched.is_some();
        let read_first = prefetched.is_none();
        let mut buf = prefetched.unwrap_or_default();
        if !proxy_protocol {
            let source = select_source(&self.state.routing, peer, None)
                .map_err(|e| ProxyError::failed(Leg::RoutingPolicy, e))?;
            return Ok(Session {
                source,
                target: resolve_target(target, bound.port(), None),
                pending: buf,
                datagram,
            });
        }

        if read_first {
            buf.resize(PP_PROBE_SIZE, 0);
            let n = local.read(&mut buf).await.map_err(read_failed)?;
            if n == 0 && !local.message_oriented() {
                return Err(read_failed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "closed before proxy preamble",
                )));
            }
            buf.truncate(n);
        }

        let header = match transport {
            Transport::Tcp => decode_pp(&buf),
            Transport::Udp => decode_spp(&buf),
        }
        .map_err(|e| ProxyError::failed(Leg::Preamble, e.into()))?;
        debug!(src = %header.src, dst = %header.dst, len = header.len, "decoded proxy preamble");

        let source = select_source(&self.state.routing, peer, Some(header.src))
            .map_err(|e| ProxyError::failed(Leg::RoutingPolicy, e))?;

        let pending = match transport {
            // The PP header is consumed here; only the payload travels on.
            Transport::Tcp => buf.split_off(header.len),
            // The SPP header is passed on byte for byte.
            Transport::Udp => buf,
        };

        Ok(Session {
            source,
            target: resolve_target(target, bound.port(), Some(header.dst.port())),
            pending,
            datagram,
        })
    }

    async fn connect(&self, mut local: Box<dyn Duplex>, session: Session) -> ProxyError {
        let transport = local.transport();
        let mut remote = match self
            .dialer
            .dial(transport, session.source, session.target)
            .await
        {
            Ok(conn) => conn,
            Err(source) => {
                if let Err(e) = local.set_reset_on_close() {
                    debug!(error = %e, "cannot arm reset on close");
                }
                drop(local);
                return ProxyError::failed(
                    Leg::Dial,
                    GatewayError::Dial {
                        dest: session.target,
                        source,
                    },
                );
            }
        };

        let flushed = if !session.pending.is_empty() {
            remote.write_all(&session.pending).await
        } else if session.datagram {
            // An empty first datagram is still a datagram.
            remote.write(&[]).await.map(|_| ())
        } else {
            Ok(())
        };
        if let Err(source) = flushed {
            return ProxyError::failed(
                Leg::Splice,
                GatewayError::Splice {
                    side: SpliceSide::Remote,
                    source,
                },
            );
        }

        splice(local, remote, Vec::new()).await
    }
}

/// Pick the source address to present on the far side, port zeroed.
///
/// Without a declared address the observed `peer` is used when spoofable
/// and dropped silently otherwise. A declared address that is not
/// spoofable is an error.
pub fn select_source(
    policy: &RoutingPolicy,
    peer: SocketAddr,
    declared: Option<SocketAddr>,
) -> GatewayResult<Option<SocketAddr>> {
    match declared {
        Some(addr) => {
            policy.check_declared(addr.ip())?;
            Ok(Some(SocketAddr::new(addr.ip().to_canonical(), 0)))
        }
        None if policy.is_spoofable(peer.ip()) => {
            Ok(Some(SocketAddr::new(peer.ip().to_canonical(), 0)))
        }
        None => Ok(None),
    }
}

/// Fill in a zero target port. A nonzero rule port always wins; otherwise a
/// declared destination port beats the port the client connected to.
pub fn resolve_target(
    target: SocketAddr,
    local_port: u16,
    declared_port: Option<u16>,
) -> SocketAddr {
    if target.port() != 0 {
        return target;
    }
    SocketAddr::new(target.ip(), declared_port.unwrap_or(local_port))
}

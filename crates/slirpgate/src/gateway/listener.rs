//! Host-side listeners for local-forward rules.
//!
//! A TCP rule binds one listener whose accept loop spawns one forwarding
//! task per connection. An accept error ends that rule's loop for good.
//!
//! A UDP rule binds one socket with `SO_REUSEADDR`/`SO_REUSEPORT` and reads
//! datagrams from peers it has no conversation with yet. For each, it opens
//! a pseudo-connection: a second socket bound to the same local address and
//! connected to the peer, so the kernel routes that peer's later datagrams
//! there instead of to the listener. The demux is not synchronized against
//! itself: two datagrams queued from a new peer before the first
//! pseudo-connection exists each get their own session.
//!
//! A keep-alive period on the rule becomes TCP keepalive on accepted
//! connections and an idle timeout on UDP pseudo-connections.

use super::forwarder::Forwarder;
use crate::config::ForwardRule;
use crate::error::{GatewayError, GatewayResult};
use slirpgate_core::transport::UdpOpenOptions;
use slirpgate_core::{TcpConn, Transport, UdpConn};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

/// Receive buffer for the UDP demux; fits any datagram.
const DATAGRAM_BUF_SIZE: usize = 64 * 1024;

/// Binds local-forward rules and feeds their traffic to a [`Forwarder`].
pub struct ListenerManager {
    forwarder: Arc<Forwarder>,
}

impl ListenerManager {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Bind `rule` and spawn its accept/read loop.
    ///
    /// Returns the address actually bound, which differs from the rule's
    /// when it asked for port 0.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Bind`] if the socket cannot be bound. The failure
    /// concerns this rule only.
    pub async fn start(&self, rule: Arc<ForwardRule>) -> GatewayResult<SocketAddr> {
        let bind_err = |source: io::Error| GatewayError::Bind {
            transport: rule.transport,
            addr: rule.bind,
            source,
        };

        match rule.transport {
            Transport::Tcp => {
                let listener = TcpListener::bind(rule.bind).await.map_err(bind_err)?;
                let bound = listener.local_addr().map_err(bind_err)?;
                info!(rule = %rule, bound = %bound, "tcp forward listening");
                tokio::spawn(accept_loop(listener, rule.clone(), self.forwarder.clone()));
                Ok(bound)
            }
            Transport::Udp => {
                let socket = bind_udp_listener(rule.bind).map_err(bind_err)?;
                let bound = socket.local_addr().map_err(bind_err)?;
                info!(rule = %rule, bound = %bound, "udp forward listening");
                let opts = UdpOpenOptions {
                    reuse: true,
                    transparent: false,
                };
                let open = move |peer| UdpConn::open(bound, peer, opts);
                tokio::spawn(demux_loop(socket, open, rule.clone(), self.forwarder.clone()));
                Ok(bound)
            }
        }
    }
}

fn bind_udp_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn accept_loop(listener: TcpListener, rule: Arc<ForwardRule>, forwarder: Arc<Forwarder>) {
    let keepalive = rule.keep_alive.period();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, rule = %rule, "accepted");
                let conn = TcpConn::new(stream);
                if let Some(idle) = keepalive {
                    if let Err(e) = conn.set_keepalive(idle) {
                        debug!(peer = %peer, error = %e, "cannot enable tcp keepalive");
                    }
                }
                let forwarder = forwarder.clone();
                let rule = rule.clone();
                tokio::spawn(async move {
                    forwarder
                        .forward(
                            Box::new(conn),
                            rule.target,
                            rule.proxy_protocol,
                            None,
                        )
                        .await
                });
            }
            Err(e) => {
                warn!(rule = %rule, error = %e, "accept failed, closing listener");
                break;
            }
        }
    }
}

/// `open` creates the pseudo-connection for a new peer.
async fn demux_loop<F>(
    socket: UdpSocket,
    open: F,
    rule: Arc<ForwardRule>,
    forwarder: Arc<Forwarder>,
) where
    F: Fn(SocketAddr) -> io::Result<UdpConn> + Send + 'static,
{
    let close_on_write = rule.keep_alive.close_on_write();
    let idle = rule.keep_alive.period();
    let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(rule = %rule, error = %e, "udp read failed, closing listener");
                break;
            }
        };

        let mut conn = match open(peer) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, rule = %rule, error = %e, "cannot open pseudo-connection, dropping datagram");
                continue;
            }
        };
        conn.set_close_on_write(close_on_write);
        conn.set_idle_timeout(idle);
        debug!(peer = %peer, rule = %rule, len = n, "new udp peer");

        let first = buf[..n].to_vec();
        let forwarder = forwarder.clone();
        let rule = rule.clone();
        tokio::spawn(async move {
            forwarder
                .forward(Box::new(conn), rule.target, rule.proxy_protocol, Some(first))
                .await
        });
    }
}

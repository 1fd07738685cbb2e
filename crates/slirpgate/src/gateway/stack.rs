//! The dial primitive the forwarding engine uses to reach the far side.
//!
//! A virtual TCP/IP stack attached to the guest implements [`Dialer`] to open
//! connections into the guest; [`HostStack`] implements it with kernel
//! sockets for reaching the host network.

use slirpgate_core::transport::UdpOpenOptions;
use slirpgate_core::{Duplex, TcpConn, Transport, UdpConn};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Future returned by [`Dialer::dial`].
pub type DialFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<Box<dyn Duplex>>> + Send + 'a>>;

/// Opens a duplex endpoint to `dest`, optionally presenting `source` as the
/// connection's origin.
pub trait Dialer: Send + Sync {
    fn dial(
        &self,
        transport: Transport,
        source: Option<SocketAddr>,
        dest: SocketAddr,
    ) -> DialFuture<'_>;
}

/// Kernel-socket dialer.
///
/// When a source is requested the socket is made `IP_TRANSPARENT` and bound
/// to it, which needs `CAP_NET_ADMIN` and a matching route; if the kernel
/// refuses, the dial proceeds anonymously.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStack;

impl HostStack {
    async fn dial_tcp(source: Option<SocketAddr>, dest: SocketAddr) -> io::Result<TcpStream> {
        if let Some(src) = source {
            match transparent_tcp_socket(src, dest) {
                Ok(socket) => return socket.connect(dest).await,
                Err(e) => {
                    debug!(source = %src, dest = %dest, error = %e, "cannot bind spoofed source, dialing anonymously");
                }
            }
        }
        TcpStream::connect(dest).await
    }

    fn dial_udp(source: Option<SocketAddr>, dest: SocketAddr) -> io::Result<UdpConn> {
        if let Some(src) = source {
            let opts = UdpOpenOptions {
                reuse: false,
                transparent: true,
            };
            match UdpConn::open(src, dest, opts) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(source = %src, dest = %dest, error = %e, "cannot bind spoofed source, dialing anonymously");
                }
            }
        }
        UdpConn::open(unspecified_for(dest), dest, UdpOpenOptions::default())
    }
}

impl Dialer for HostStack {
    fn dial(
        &self,
        transport: Transport,
        source: Option<SocketAddr>,
        dest: SocketAddr,
    ) -> DialFuture<'_> {
        Box::pin(async move {
            let conn: Box<dyn Duplex> = match transport {
                Transport::Tcp => Box::new(TcpConn::new(Self::dial_tcp(source, dest).await?)),
                Transport::Udp => Box::new(Self::dial_udp(source, dest)?),
            };
            Ok(conn)
        })
    }
}

fn transparent_tcp_socket(source: SocketAddr, dest: SocketAddr) -> io::Result<TcpSocket> {
    let socket = Socket::new(Domain::for_address(dest), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(target_os = "linux")]
    socket.set_ip_transparent(true)?;
    socket.bind(&source.into())?;
    socket.set_nonblocking(true)?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

fn unspecified_for(dest: SocketAddr) -> SocketAddr {
    let ip = match dest {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    #[tokio::test]
    async fn test_dial_tcp_anonymous() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = HostStack.dial(Transport::Tcp, None, addr).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();
        assert_eq!(conn.transport(), Transport::Tcp);
        assert_eq!(conn.peer_addr().unwrap(), addr);

        conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_dial_falls_back_when_source_unusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A v6 source cannot be bound on a v4 socket; the dial still succeeds.
        let source: SocketAddr = "[2001:db8::1]:0".parse().unwrap();
        let conn = HostStack.dial(Transport::Tcp, Some(source), addr).await.unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(conn.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_dial_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut conn = HostStack.dial(Transport::Udp, None, addr).await.unwrap();
        assert_eq!(conn.transport(), Transport::Udp);
        conn.write_all(b"query").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
    }
}

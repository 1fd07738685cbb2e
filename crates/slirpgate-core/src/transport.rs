//! Duplex endpoints spliced together by the forwarding engine.
//!
//! Every leg of a forwarded session, whether a TCP stream, a demultiplexed
//! UDP conversation or an in-memory pipe, is handled through the [`Duplex`]
//! trait so the engine never needs to know which transport it is relaying.

use serde::{Deserialize, Serialize};
use socket2::{Domain, SockRef, Socket, TcpKeepalive, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Transport protocol of a forwarding rule or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// A bidirectional endpoint: read, write, close (via `shutdown` or drop),
/// addressing, and abrupt-reset control.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {
    /// Transport this endpoint speaks.
    fn transport(&self) -> Transport;

    /// Local address of the endpoint.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Address of the remote peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Make the next close abrupt (TCP RST instead of FIN). A no-op for
    /// transports without the notion.
    fn set_reset_on_close(&mut self) -> io::Result<()>;

    /// Whether the session should be torn down right after the first write
    /// to this endpoint.
    fn close_on_write(&self) -> bool {
        false
    }

    /// Whether each read yields exactly one message. A zero-length read from
    /// such an endpoint is an empty message, not end-of-stream.
    fn message_oriented(&self) -> bool {
        false
    }

    /// How long the session may sit without traffic before it is torn down.
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }
}

// ── TCP ──────────────────────────────────────────────────────────────

/// A TCP stream endpoint.
#[derive(Debug)]
pub struct TcpConn {
    stream: TcpStream,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    /// Enable TCP keep-alive probing after `idle` without traffic, repeating
    /// every `idle` until the peer answers or the kernel gives up.
    pub fn set_keepalive(&self, idle: Duration) -> io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(idle);
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        let keepalive = keepalive.with_interval(idle);
        SockRef::from(&self.stream).set_tcp_keepalive(&keepalive)
    }
}

impl Duplex for TcpConn {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn set_reset_on_close(&mut self) -> io::Result<()> {
        // SO_LINGER with a zero timeout turns close() into a RST.
        SockRef::from(&self.stream).set_linger(Some(Duration::ZERO))
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

// ── UDP ──────────────────────────────────────────────────────────────

/// Socket options applied when opening a [`UdpConn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpOpenOptions {
    /// Set `SO_REUSEADDR` and `SO_REUSEPORT`, required to share a port with
    /// the listening socket.
    pub reuse: bool,
    /// Set `IP_TRANSPARENT` so the socket may bind a non-local address.
    pub transparent: bool,
}

/// A connected UDP socket treated as one conversation with a single peer.
///
/// Reads yield one datagram each; writes send one datagram each.
#[derive(Debug)]
pub struct UdpConn {
    socket: UdpSocket,
    close_on_write: bool,
    idle_timeout: Option<Duration>,
}

impl UdpConn {
    /// Bind `local`, connect to `peer` and register the socket with the
    /// runtime. Must be called from within a tokio runtime.
    ///
    /// With [`UdpOpenOptions::reuse`] and `local` equal to a listening
    /// socket's address, the kernel delivers the peer's further datagrams to
    /// this connected socket instead of the listener.
    pub fn open(local: SocketAddr, peer: SocketAddr, opts: UdpOpenOptions) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, None)?;
        if opts.reuse {
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
        }
        if opts.transparent {
            #[cfg(target_os = "linux")]
            socket.set_ip_transparent(true)?;
        }
        socket.bind(&local.into())?;
        socket.connect(&peer.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!(local = %local, peer = %peer, "udp conversation opened");
        Ok(Self::new(socket))
    }

    /// Wrap an already connected socket.
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            close_on_write: false,
            idle_timeout: None,
        }
    }

    /// Tear the session down after the first datagram written back.
    pub fn set_close_on_write(&mut self, close: bool) {
        self.close_on_write = close;
    }

    /// Tear the session down after `idle` without a datagram either way.
    pub fn set_idle_timeout(&mut self, idle: Option<Duration>) {
        self.idle_timeout = idle;
    }
}

impl Duplex for UdpConn {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    fn set_reset_on_close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close_on_write(&self) -> bool {
        self.close_on_write
    }

    fn message_oriented(&self) -> bool {
        true
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// An in-memory endpoint backed by [`tokio::io::duplex`], carrying fixed
/// addresses. Useful for embedding a stack that hands out byte pipes, and
/// for exercising the engine without sockets.
#[derive(Debug)]
pub struct MemoryConn {
    stream: DuplexStream,
    transport: Transport,
    local: SocketAddr,
    peer: SocketAddr,
    reset: Arc<AtomicBool>,
    close_on_write: bool,
    idle_timeout: Option<Duration>,
}

impl MemoryConn {
    /// Create a connected pair. Each side's peer address is the other's
    /// local address.
    pub fn pair(transport: Transport, a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (sa, sb) = tokio::io::duplex(64 * 1024);
        (
            Self::new(sa, transport, a, b),
            Self::new(sb, transport, b, a),
        )
    }

    fn new(
        stream: DuplexStream,
        transport: Transport,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            stream,
            transport,
            local,
            peer,
            reset: Arc::new(AtomicBool::new(false)),
            close_on_write: false,
            idle_timeout: None,
        }
    }

    /// Shared flag flipped by [`Duplex::set_reset_on_close`]; stays readable
    /// after the endpoint has been consumed.
    pub fn reset_flag(&self) -> Arc<AtomicBool> {
        self.reset.clone()
    }

    pub fn with_close_on_write(mut self, close: bool) -> Self {
        self.close_on_write = close;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }
}

impl Duplex for MemoryConn {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn set_reset_on_close(&mut self) -> io::Result<()> {
        self.reset.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_on_write(&self) -> bool {
        self.close_on_write
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

//! Bidirectional relay between two established endpoints.
//!
//! Both directions run concurrently inside the session task. The first I/O
//! error on either direction decides the reported outcome and drops both
//! endpoints. End-of-stream is handled per transport:
//!
//! - **Streams** propagate EOF as a write shutdown to the opposite side and
//!   keep relaying the other direction until it also ends.
//! - **Datagrams** have no half-close, so the end of either direction ends
//!   the session. This is also how a close-on-write endpoint tears a UDP
//!   conversation down after its first reply. An empty datagram read from a
//!   message-oriented endpoint is relayed as an empty datagram. If either
//!   endpoint carries an idle timeout, the session ends once neither
//!   direction has moved a datagram for that long.

use crate::error::{GatewayError, Leg, ProxyError, SpliceSide};
use slirpgate_core::{Duplex, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Large enough for any UDP datagram.
const RELAY_BUF_SIZE: usize = 64 * 1024;

/// Relay `a` ↔ `b` until both directions finish or one fails.
///
/// A non-empty `preamble` is written to `b` once, in the same write as the
/// first chunk relayed from `a`.
pub async fn splice(a: Box<dyn Duplex>, b: Box<dyn Duplex>, preamble: Vec<u8>) -> ProxyError {
    let datagram = a.transport() == Transport::Udp || b.transport() == Transport::Udp;
    let idle = if datagram {
        match (a.idle_timeout(), b.idle_timeout()) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, y) => x.or(y),
        }
    } else {
        None
    };
    let activity = Activity::new();

    let outbound_opts = RelayOptions {
        sides: (SpliceSide::Local, SpliceSide::Remote),
        datagram,
        empty_is_message: a.message_oriented(),
        stop_after_write: b.close_on_write(),
        idle,
    };
    let inbound_opts = RelayOptions {
        sides: (SpliceSide::Remote, SpliceSide::Local),
        datagram,
        empty_is_message: b.message_oriented(),
        stop_after_write: a.close_on_write(),
        idle,
    };

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let outbound = relay(a_read, b_write, preamble, outbound_opts, &activity);
    let inbound = relay(b_read, a_write, Vec::new(), inbound_opts, &activity);

    let result = if datagram {
        tokio::select! {
            r = outbound => r.map(|n| debug!(bytes = n, "outbound finished")),
            r = inbound => r.map(|n| debug!(bytes = n, "inbound finished")),
        }
    } else {
        tokio::try_join!(outbound, inbound)
            .map(|(up, down)| debug!(up, down, "both directions finished"))
    };

    match result {
        Ok(()) => ProxyError::ok(),
        Err(e) => ProxyError::failed(Leg::Splice, e),
    }
}

/// Per-direction relay settings.
#[derive(Debug, Clone, Copy)]
struct RelayOptions {
    /// (reader, writer) endpoints, for error reporting.
    sides: (SpliceSide, SpliceSide),
    datagram: bool,
    /// A zero-length read is an empty datagram rather than EOF.
    empty_is_message: bool,
    stop_after_write: bool,
    idle: Option<Duration>,
}

/// Time of the last datagram moved in either direction.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Copy `reader` into `writer` until EOF or idle expiry, returning the
/// payload byte count.
async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    mut preamble: Vec<u8>,
    opts: RelayOptions,
    activity: &Activity,
) -> Result<u64, GatewayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (read_side, write_side) = opts.sides;
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let read = match opts.idle {
            None => reader.read(&mut buf).await,
            Some(idle) => {
                let remaining = idle.saturating_sub(activity.idle_for());
                if remaining.is_zero() {
                    debug!(idle_ms = idle.as_millis() as u64, "session idle, closing");
                    return Ok(total);
                }
                match tokio::time::timeout(remaining, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    // Re-check: the other direction may have been active.
                    Err(_) => continue,
                }
            }
        };
        let n = read.map_err(|source| GatewayError::Splice {
            side: read_side,
            source,
        })?;
        activity.touch();

        if n == 0 && !opts.empty_is_message {
            if !opts.datagram {
                // The peer may already be gone; nothing to report.
                let _ = writer.shutdown().await;
            }
            return Ok(total);
        }

        let written = if !preamble.is_empty() {
            let mut first = std::mem::take(&mut preamble);
            first.extend_from_slice(&buf[..n]);
            writer.write_all(&first).await
        } else if n == 0 {
            // write_all skips empty buffers; one write sends one empty datagram.
            writer.write(&[]).await.map(|_| ())
        } else {
            writer.write_all(&buf[..n]).await
        };
        written.map_err(|source| GatewayError::Splice {
            side: write_side,
            source,
        })?;
        total += n as u64;

        if opts.stop_after_write {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FailingConn;
    use slirpgate_core::transport::UdpOpenOptions;
    use slirpgate_core::{MemoryConn, UdpConn};
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_stream_splice_relays_both_ways() {
        let (mut client, local) =
            MemoryConn::pair(Transport::Tcp, addr("192.0.2.1:5000"), addr("127.0.0.1:8080"));
        let (remote, mut server) =
            MemoryConn::pair(Transport::Tcp, addr("10.0.2.2:40000"), addr("10.0.2.100:80"));

        let task = tokio::spawn(splice(Box::new(local), Box::new(remote), Vec::new()));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");

        // Half-closed: the reply direction still flows.
        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"response");

        let pe = task.await.unwrap();
        assert!(!pe.is_err(), "unexpected error: {pe}");
    }

    #[tokio::test]
    async fn test_preamble_written_once_before_payload() {
        let (mut client, local) =
            MemoryConn::pair(Transport::Tcp, addr("192.0.2.1:5000"), addr("127.0.0.1:8080"));
        let (remote, mut server) =
            MemoryConn::pair(Transport::Tcp, addr("10.0.2.2:40000"), addr("10.0.2.100:80"));

        let task = tokio::spawn(splice(Box::new(local), Box::new(remote), b"HDR".to_vec()));

        client.write_all(b"one").await.unwrap();
        let mut first = [0u8; 6];
        server.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"HDRone");

        client.write_all(b"two").await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"two");

        drop(server);
        let pe = task.await.unwrap();
        assert!(!pe.is_err());
    }

    #[tokio::test]
    async fn test_datagram_close_on_write_ends_session() {
        let (mut client, local) =
            MemoryConn::pair(Transport::Udp, addr("192.0.2.1:5000"), addr("127.0.0.1:5353"));
        let local = local.with_close_on_write(true);
        let (remote, mut server) =
            MemoryConn::pair(Transport::Udp, addr("10.0.2.2:40000"), addr("10.0.2.100:53"));

        let task = tokio::spawn(splice(Box::new(local), Box::new(remote), Vec::new()));

        server.write_all(b"reply").await.unwrap();
        let mut got = [0u8; 5];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply");

        // Neither test endpoint closed anything, yet the splice finishes.
        let pe = task.await.unwrap();
        assert!(!pe.is_err());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_first_error_names_failing_side() {
        let (mut client, local) =
            MemoryConn::pair(Transport::Tcp, addr("192.0.2.1:5000"), addr("127.0.0.1:8080"));
        let remote = FailingConn::new(addr("10.0.2.100:80"));
        client.write_all(b"lost").await.unwrap();

        let pe = splice(Box::new(local), Box::new(remote), Vec::new()).await;
        assert_eq!(pe.leg, Some(Leg::Splice));
        assert!(matches!(
            pe.error,
            Some(GatewayError::Splice {
                side: SpliceSide::Remote,
                ..
            })
        ));
    }

    /// Two connected UDP endpoints facing `client` and `server` sockets.
    async fn udp_legs() -> (UdpSocket, UdpConn, UdpConn, UdpSocket) {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let any: SocketAddr = addr("127.0.0.1:0");
        let a = UdpConn::open(any, client.local_addr().unwrap(), UdpOpenOptions::default())
            .unwrap();
        let b = UdpConn::open(any, server.local_addr().unwrap(), UdpOpenOptions::default())
            .unwrap();
        (client, a, b, server)
    }

    #[tokio::test]
    async fn test_empty_datagrams_are_relayed() {
        let (client, a, b, server) = udp_legs().await;
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let task = tokio::spawn(splice(Box::new(a), Box::new(b), Vec::new()));

        let mut buf = [0u8; 16];
        client.send_to(b"", a_addr).await.unwrap();
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!((n, from), (0, b_addr));

        server.send_to(b"", b_addr).await.unwrap();
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!((n, from), (0, a_addr));

        // Same session, same upstream source.
        client.send_to(b"more", a_addr).await.unwrap();
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"more");
        assert_eq!(from, b_addr);
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_idle_datagram_session_ends() {
        let (client, mut a, b, server) = udp_legs().await;
        a.set_idle_timeout(Some(Duration::from_millis(100)));
        let a_addr = a.local_addr().unwrap();
        let task = tokio::spawn(splice(Box::new(a), Box::new(b), Vec::new()));

        client.send_to(b"hi", a_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        let pe = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("idle session should end")
            .unwrap();
        assert!(!pe.is_err());
    }

    #[tokio::test]
    async fn test_traffic_in_one_direction_keeps_session_alive() {
        let (client, mut a, b, server) = udp_legs().await;
        a.set_idle_timeout(Some(Duration::from_millis(150)));
        let a_addr = a.local_addr().unwrap();
        let task = tokio::spawn(splice(Box::new(a), Box::new(b), Vec::new()));

        let mut buf = [0u8; 16];
        for _ in 0..4 {
            client.send_to(b"tick", a_addr).await.unwrap();
            server.recv_from(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        assert!(!task.is_finished());
        task.abort();
    }
}

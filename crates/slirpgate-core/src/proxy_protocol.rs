//! PROXY protocol preambles carried in front of forwarded traffic.
//!
//! Two encodings are supported:
//!
//! - **PP** (TCP): the v1 text header
//!   `PROXY <TCP4|TCP6> <src> <dst> <sport> <dport>\r\n`, at most 107 bytes,
//!   sent once at the start of the byte stream.
//! - **SPP** (UDP): a fixed 38-byte binary header prefixed to a datagram.
//!
//! SPP wire format (all integers big-endian):
//!
//! ```text
//!  0      2                  18                 34      36      38
//!  +------+------------------+------------------+-------+-------+
//!  | 56EC | client address   | proxy address    | cport | pport |
//!  +------+------------------+------------------+-------+-------+
//! ```
//!
//! Addresses are 16 bytes; IPv4 is carried IPv4-mapped (`::ffff:a.b.c.d`)
//! and decoded back to a plain IPv4 address.

use crate::error::{CoreError, CoreResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Size of the bounded read used to probe for a PP header.
pub const PP_PROBE_SIZE: usize = 4096;

/// Longest legal v1 header, including the trailing CRLF.
pub const PP_MAX_LEN: usize = 107;

const PP_SIGNATURE: &[u8] = b"PROXY ";

/// First two bytes of every SPP header.
pub const SPP_MAGIC: u16 = 0x56EC;

/// Fixed length of an SPP header.
pub const SPP_HEADER_LEN: usize = 38;

/// A decoded preamble: the declared endpoints and the number of bytes the
/// header occupied at the front of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client endpoint.
    pub src: SocketAddr,
    /// Endpoint the client originally connected to.
    pub dst: SocketAddr,
    /// Header length in bytes; payload starts at this offset.
    pub len: usize,
}

/// Decode a PP v1 text header from the front of `buf`.
///
/// Returns [`CoreError::Incomplete`] when `buf` is a valid prefix of a header
/// that has not been terminated yet, and [`CoreError::Unsupported`] for
/// `PROXY UNKNOWN`, which carries no address worth preserving.
pub fn decode_pp(buf: &[u8]) -> CoreResult<ProxyHeader> {
    let sig_len = PP_SIGNATURE.len().min(buf.len());
    if buf[..sig_len] != PP_SIGNATURE[..sig_len] {
        return Err(CoreError::Malformed("missing PROXY signature".into()));
    }

    let window = &buf[..buf.len().min(PP_MAX_LEN)];
    let end = match window.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos,
        None if buf.len() < PP_MAX_LEN => return Err(CoreError::Incomplete),
        None => {
            return Err(CoreError::Malformed(format!(
                "no CRLF within {PP_MAX_LEN} bytes"
            )))
        }
    };

    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| CoreError::Malformed("header is not ASCII".into()))?;
    let fields: Vec<&str> = line.split(' ').collect();

    let v6 = match fields.get(1).copied() {
        Some("TCP4") => false,
        Some("TCP6") => true,
        Some("UNKNOWN") => return Err(CoreError::Unsupported("UNKNOWN".into())),
        Some(other) => return Err(CoreError::Malformed(format!("unknown protocol {other:?}"))),
        None => return Err(CoreError::Malformed("missing protocol".into())),
    };
    if fields.len() != 6 {
        return Err(CoreError::Malformed(format!(
            "expected 6 fields, got {}",
            fields.len()
        )));
    }

    let src = SocketAddr::new(parse_ip(fields[2], v6)?, parse_port(fields[4])?);
    let dst = SocketAddr::new(parse_ip(fields[3], v6)?, parse_port(fields[5])?);

    Ok(ProxyHeader {
        src,
        dst,
        len: end + 2,
    })
}

/// Encode a PP v1 text header. Both endpoints must share an address family.
pub fn encode_pp(src: SocketAddr, dst: SocketAddr) -> CoreResult<Vec<u8>> {
    let proto = match (src, dst) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
        (SocketAddr::V6(_), SocketAddr::V6(_)) => "TCP6",
        _ => return Err(CoreError::FamilyMismatch { src, dst }),
    };
    Ok(format!(
        "PROXY {proto} {} {} {} {}\r\n",
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
    .into_bytes())
}

/// Decode an SPP header from the front of a received datagram.
///
/// The caller is expected to keep `&buf[..header.len]` verbatim if the header
/// has to be passed on unmodified.
pub fn decode_spp(buf: &[u8]) -> CoreResult<ProxyHeader> {
    if buf.len() < SPP_HEADER_LEN {
        return Err(CoreError::Incomplete);
    }
    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != SPP_MAGIC {
        return Err(CoreError::Malformed(format!("bad SPP magic {magic:#06x}")));
    }

    let src_ip = ip_from_octets(&buf[2..18]);
    let dst_ip = ip_from_octets(&buf[18..34]);
    let src_port = u16::from_be_bytes([buf[34], buf[35]]);
    let dst_port = u16::from_be_bytes([buf[36], buf[37]]);

    Ok(ProxyHeader {
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        len: SPP_HEADER_LEN,
    })
}

/// Encode an SPP header. Mixed address families are allowed since both
/// addresses travel as 16-byte IPv6.
pub fn encode_spp(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(SPP_HEADER_LEN);
    header.extend_from_slice(&SPP_MAGIC.to_be_bytes());
    header.extend_from_slice(&ip_to_octets(src.ip()));
    header.extend_from_slice(&ip_to_octets(dst.ip()));
    header.extend_from_slice(&src.port().to_be_bytes());
    header.extend_from_slice(&dst.port().to_be_bytes());
    header
}

fn parse_ip(s: &str, v6: bool) -> CoreResult<IpAddr> {
    let parsed = if v6 {
        s.parse::<Ipv6Addr>().map(IpAddr::V6).ok()
    } else {
        s.parse::<Ipv4Addr>().map(IpAddr::V4).ok()
    };
    parsed.ok_or_else(|| CoreError::Malformed(format!("invalid address {s:?}")))
}

fn parse_port(s: &str) -> CoreResult<u16> {
    // v1 forbids leading zeros
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        return Err(CoreError::Malformed(format!("invalid port {s:?}")));
    }
    s.parse::<u16>()
        .map_err(|_| CoreError::Malformed(format!("invalid port {s:?}")))
}

fn ip_from_octets(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    let v6 = Ipv6Addr::from(octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn ip_to_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

//! slirpgate-core: shared library for the slirpgate network gateway.
//!
//! Provides the PROXY protocol preamble codecs (text v1 for TCP, the binary
//! "simple proxy protocol" for UDP) and the duplex endpoint abstraction the
//! forwarding engine splices together.

pub mod error;
pub mod proxy_protocol;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{CoreError, CoreResult};
pub use proxy_protocol::{decode_pp, decode_spp, encode_pp, encode_spp, ProxyHeader};
pub use transport::{Duplex, MemoryConn, TcpConn, Transport, UdpConn};

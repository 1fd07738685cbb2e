use slirpgate_core::{CoreError, Transport};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid forward rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("failed to bind {transport}://{addr}: {source}")]
    Bind {
        transport: Transport,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("preamble error: {0}")]
    Preamble(#[from] CoreError),

    #[error("PP source {addr} denied by routing policy")]
    RoutingDenied { addr: IpAddr },

    #[error("dial {dest} failed: {source}")]
    Dial { dest: SocketAddr, source: io::Error },

    #[error("{side} side: {source}")]
    Splice { side: SpliceSide, source: io::Error },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Which endpoint of a splice an I/O error was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceSide {
    /// The accepted (listening-side) endpoint.
    Local,
    /// The dialed endpoint.
    Remote,
}

impl fmt::Display for SpliceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpliceSide::Local => f.write_str("local"),
            SpliceSide::Remote => f.write_str("remote"),
        }
    }
}

/// Stage of a forwarded session that failed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    LocalRead,
    Preamble,
    RoutingPolicy,
    Dial,
    Splice,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Leg::LocalRead => "local-read",
            Leg::Preamble => "preamble",
            Leg::RoutingPolicy => "routing-policy",
            Leg::Dial => "dial",
            Leg::Splice => "splice",
        };
        f.write_str(s)
    }
}

/// Outcome of one forwarded session, kept for logging.
///
/// `leg` is `None` when the session ended cleanly.
#[derive(Debug, Default)]
pub struct ProxyError {
    pub leg: Option<Leg>,
    pub error: Option<GatewayError>,
}

impl ProxyError {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(leg: Leg, error: GatewayError) -> Self {
        Self {
            leg: Some(leg),
            error: Some(error),
        }
    }

    pub fn is_err(&self) -> bool {
        self.leg.is_some()
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.leg, &self.error) {
            (None, _) => f.write_str("ok"),
            (Some(leg), Some(err)) => write!(f, "{leg}: {err}"),
            (Some(leg), None) => write!(f, "{leg}"),
        }
    }
}

use thiserror::Error;

/// Errors produced by the preamble codecs and endpoint layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("incomplete proxy protocol header")]
    Incomplete,

    #[error("malformed proxy protocol header: {0}")]
    Malformed(String),

    #[error("unsupported proxy protocol transport: {0}")]
    Unsupported(String),

    #[error("address family mismatch: {src} vs {dst}")]
    FamilyMismatch {
        src: std::net::SocketAddr,
        dst: std::net::SocketAddr,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

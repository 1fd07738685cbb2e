//! slirpgate: user-space network gateway.
//!
//! Bridges a guest behind a virtual network stack to the host network with
//! local forwards (host listens, guest receives) and remote forwards (guest
//! connects, host receives), optionally carrying the original client address
//! across the gateway in a PROXY protocol preamble.

pub mod config;
pub mod dns;
pub mod error;
pub mod gateway;
pub mod state;

pub use error::{GatewayError, GatewayResult, Leg, ProxyError, SpliceSide};
pub use state::GatewayState;

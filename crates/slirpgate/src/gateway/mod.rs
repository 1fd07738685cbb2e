//! Gateway module: port forwarding between the host network and the guest.
//!
//! # Submodule Architecture
//!
//! - **[`policy`]**: the [`RoutingPolicy`] deny/allow tables that decide
//!   whether a client address may be preserved on the far side.
//!
//! - **[`stack`]**: the [`Dialer`] seam. A guest network stack implements it
//!   to open connections into the guest; [`HostStack`] implements it with
//!   kernel sockets.
//!
//! - **[`forwarder`]**: the [`Forwarder`] runs one session end to end:
//!   probe for a PROXY preamble, pick the source to present, resolve the
//!   target, dial it and hand both endpoints to the splice.
//!
//! - **[`splice`]**: the bidirectional relay with first-error attribution.
//!
//! - **[`listener`]**: the [`ListenerManager`] binds local-forward rules on
//!   the host, accepting TCP connections and demultiplexing UDP peers into
//!   per-peer connected sockets.
//!
//! - **[`remote`]**: the [`RemoteForwarder`] routes connections the guest
//!   opens towards a remote-forward bind address out to the host network.
//!
//! # Data Flow
//!
//! ```text
//! host client
//!   → ListenerManager (accept / UDP demux)
//!     → Forwarder::forward
//!         → decode_pp / decode_spp       (if the rule carries a preamble)
//!         → RoutingPolicy::check_declared / is_spoofable
//!         → Dialer::dial                 (guest stack)
//!         → splice
//!
//! guest client
//!   → guest stack → RemoteForwarder::handle_incoming
//!     → Forwarder::forward → HostStack::dial → splice
//! ```

pub mod forwarder;
pub mod listener;
pub mod policy;
pub mod remote;
pub mod splice;
pub mod stack;

pub use forwarder::{Direction, Forwarder};
pub use listener::ListenerManager;
pub use policy::RoutingPolicy;
pub use remote::RemoteForwarder;
pub use splice::splice;
pub use stack::{DialFuture, Dialer, HostStack};

//! # udp-tunnel-net
//!
//! Socket primitives and session framing shared by both halves of a
//! udp-tunnel circuit.
//!
//! A circuit carries one datagram request and one datagram reply per
//! stream session:
//!
//! ```text
//! client ──udp──► local relay ──tcp (ssh -L)──► remote relay ──udp──► destination
//!        ◄──udp──             ◄──────tcp──────               ◄──udp──
//! ```
//!
//! - [`framing`]: request/reply encoding over a half-closed stream
//! - [`protocol`]: reply status codes and the [`Reply`] type
//! - [`socket`]: loopback bind helpers with address-carrying errors
//! - [`Graceful`]: cancellation plus task tracking for clean shutdown

pub mod framing;
mod graceful;
pub mod protocol;
pub mod socket;

pub use framing::{FrameError, read_reply, read_request, write_reply, write_request};
pub use graceful::Graceful;
pub use protocol::{Reply, ReplyStatus};
pub use socket::{BindError, bind_tcp_loopback, bind_udp_loopback};

/// Largest datagram payload relayed in either direction.
///
/// Kerberos over UDP stays below a single Ethernet MTU; anything larger is
/// expected to fall back to TCP at the client, so it is not relayed.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

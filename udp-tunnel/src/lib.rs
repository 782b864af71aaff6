//! # udp-tunnel
//!
//! Relay request/reply UDP traffic through an ssh stream tunnel.
//!
//! Some networks drop UDP but let ssh through. Kerberos clients talk to
//! their KDC over UDP, one request datagram and one reply datagram at a
//! time, which makes that traffic easy to carry over a stream: every
//! request becomes one TCP session through an `ssh -L` forward.
//!
//! ```text
//!  local host                                   far host
//! ┌─────────────────────────────┐              ┌──────────────────────────────┐
//! │ kinit ──udp──► LocalRelay ──┼── ssh -L ───►│ RemoteRelay ──udp──► KDC :88 │
//! │       ◄──udp──            ◄─┼──────────────┼─            ◄──udp──         │
//! │                             │              │                              │
//! │ Lifecycle: owns ssh, kills  │── ssh pkill ►│                              │
//! │ the remote relay on exit    │              │                              │
//! └─────────────────────────────┘              └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`local`]: datagrams in, one stream session per datagram out
//! - [`remote`]: stream sessions in, datagrams with bounded retry out
//! - [`tunnel`]: the `ssh` master process and the remote kill command
//! - [`lifecycle`]: signal handling and exactly-once cleanup
//!
//! Session framing lives in [`udp_tunnel_net`].
//!
//! ## Example
//!
//! Relay between a loopback client and a loopback destination, with a
//! plain TCP port standing in for the ssh forward:
//!
//! ```rust,no_run
//! use udp_tunnel::local::{LocalConfig, LocalRelay};
//! use udp_tunnel::remote::{RemoteConfig, RemoteRelay};
//! use udp_tunnel_net::Graceful;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graceful = Graceful::new();
//!
//! let remote = RemoteRelay::bind(RemoteConfig {
//!     listen_port: 18889,
//!     destination: "kdc.example.org:88".to_string(),
//!     ..RemoteConfig::default()
//! })
//! .await?;
//! tokio::spawn(remote.run(graceful.clone()));
//!
//! let local = LocalRelay::bind(LocalConfig {
//!     listen_port: 18888,
//!     forward_port: 18889,
//!     ..LocalConfig::default()
//! })
//! .await?;
//! local.run(graceful).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod lifecycle;
pub mod local;
pub mod remote;
pub mod tunnel;

pub use error::{LifecycleError, RelayError, SetupError, TeardownError};
pub use lifecycle::{CleanupReport, Lifecycle, Signals, Teardown, Termination};
pub use local::{LocalConfig, LocalRelay};
pub use remote::{Destination, RemoteConfig, RemoteRelay, RetryPolicy};
pub use tunnel::{SshTunnel, TunnelConfig, TunnelProcess};

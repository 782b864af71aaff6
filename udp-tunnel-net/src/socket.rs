//! Loopback listeners for both relay halves.
//!
//! Both relays only ever listen on loopback: the local relay serves clients
//! on the same machine, the remote relay is reached through the tunnel's
//! port forward. Bind failures are startup errors, so they carry the
//! address that could not be bound.

use std::net::{Ipv4Addr, SocketAddr};

/// A listener could not be bound.
#[derive(Debug, thiserror::Error)]
#[error("failed to bind {kind} listener on {addr}: {source}")]
pub struct BindError {
    pub kind: &'static str,
    pub addr: SocketAddr,
    #[source]
    pub source: std::io::Error,
}

/// Loopback address for `port`. Port 0 picks a free port.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Bind a UDP socket on `127.0.0.1:port`.
pub async fn bind_udp_loopback(port: u16) -> Result<tokio::net::UdpSocket, BindError> {
    let addr = loopback(port);
    tokio::net::UdpSocket::bind(addr)
        .await
        .map_err(|source| BindError {
            kind: "udp",
            addr,
            source,
        })
}

/// Bind a TCP listener on `127.0.0.1:port`.
pub async fn bind_tcp_loopback(port: u16) -> Result<tokio::net::TcpListener, BindError> {
    let addr = loopback(port);
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| BindError {
            kind: "tcp",
            addr,
            source,
        })
}

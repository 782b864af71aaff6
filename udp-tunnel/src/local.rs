//! Local relay: datagrams in, stream sessions out.
//!
//! Listens for datagrams on loopback. Every datagram opens a fresh stream
//! session to the tunnel's local forwarding port, and the reply that comes
//! back is sent to the datagram's sender as a single datagram.
//!
//! A request that fails for any reason (tunnel refused the connection, the
//! remote relay gave up, the session stalled) is dropped without a reply;
//! the client's own retransmission takes it from there. The loop itself
//! only stops on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use udp_tunnel_net::{Graceful, MAX_DATAGRAM_SIZE, Reply};

use crate::error::{RelayError, SetupError};

/// Local relay settings.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Loopback UDP port clients send to.
    pub listen_port: u16,
    /// Loopback TCP port of the tunnel's forward.
    pub forward_port: u16,
    /// Upper bound on one whole session, connect to last reply byte.
    pub request_timeout: Duration,
    /// Sessions allowed in flight at once.
    pub max_in_flight: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            listen_port: 18888,
            forward_port: 18889,
            request_timeout: Duration::from_secs(10),
            max_in_flight: 64,
        }
    }
}

pub struct LocalRelay {
    socket: Arc<UdpSocket>,
    forward_addr: SocketAddr,
    request_timeout: Duration,
    max_in_flight: usize,
}

impl LocalRelay {
    /// Bind the datagram listener. Nothing is connected until a request
    /// arrives, so the tunnel does not need to be up yet.
    pub async fn bind(config: LocalConfig) -> Result<Self, SetupError> {
        let socket = udp_tunnel_net::bind_udp_loopback(config.listen_port).await?;

        Ok(Self {
            socket: Arc::new(socket),
            forward_addr: udp_tunnel_net::socket::loopback(config.forward_port),
            request_timeout: config.request_timeout,
            max_in_flight: config.max_in_flight.max(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve datagrams until `graceful` is cancelled.
    pub async fn run(self, graceful: Graceful) -> std::io::Result<()> {
        tracing::info!(
            "Local relay listening on {}, forwarding to {}",
            self.socket.local_addr()?,
            self.forward_addr
        );

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        // One spare byte so an oversized datagram shows up as one.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            let (len, peer) = tokio::select! {
                _ = graceful.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!("Failed to receive datagram: {e}");
                        continue;
                    }
                },
            };

            if len > MAX_DATAGRAM_SIZE {
                tracing::warn!(
                    "Dropping request from {peer}: larger than {MAX_DATAGRAM_SIZE} bytes"
                );
                continue;
            }

            let permit = tokio::select! {
                _ = graceful.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let request = buf[..len].to_vec();
            let socket = self.socket.clone();
            let forward_addr = self.forward_addr;
            let request_timeout = self.request_timeout;

            graceful.spawn(async move {
                let _permit = permit;
                match relay_request(&socket, forward_addr, &request, peer, request_timeout).await {
                    Ok(sent) => tracing::debug!(
                        "Relayed {} byte request from {peer}, {sent} byte reply",
                        request.len()
                    ),
                    Err(e) => tracing::warn!("Dropping request from {peer}: {e}"),
                }
            });
        }

        tracing::info!("Local relay shutting down");
        Ok(())
    }
}

async fn relay_request(
    socket: &UdpSocket,
    forward_addr: SocketAddr,
    request: &[u8],
    peer: SocketAddr,
    request_timeout: Duration,
) -> Result<usize, RelayError> {
    let reply = tokio::time::timeout(request_timeout, exchange(forward_addr, request))
        .await
        .map_err(|_| RelayError::Timeout(request_timeout))??;

    match reply {
        Reply::Datagram(payload) => socket
            .send_to(&payload, peer)
            .await
            .map_err(|source| RelayError::Send { addr: peer, source }),
        Reply::Timeout { attempts } => Err(RelayError::RemoteTimeout { attempts }),
        Reply::Unreachable => Err(RelayError::Unreachable),
    }
}

/// One stream session: connect, send `request`, read the reply.
pub async fn exchange(forward_addr: SocketAddr, request: &[u8]) -> Result<Reply, RelayError> {
    let mut stream = TcpStream::connect(forward_addr)
        .await
        .map_err(|source| RelayError::Connect {
            addr: forward_addr,
            source,
        })?;

    udp_tunnel_net::write_request(&mut stream, request).await?;
    Ok(udp_tunnel_net::read_reply(&mut stream).await?)
}

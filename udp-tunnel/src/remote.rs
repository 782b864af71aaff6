//! Remote relay: stream sessions in, datagrams out.
//!
//! Runs on the far side of the tunnel. Each accepted session carries one
//! request; the relay sends it to the destination as a datagram, resending
//! on silence according to a [`RetryPolicy`], and writes back whichever
//! comes first: the destination's reply or a timeout status once the
//! policy is exhausted.
//!
//! Every session gets its own UDP socket connected to the destination, so
//! concurrent sessions never see each other's replies.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use udp_tunnel_net::{FrameError, Graceful, MAX_DATAGRAM_SIZE, Reply};

use crate::error::SetupError;

/// How long to wait for the destination, and how often to ask.
///
/// Sessions are fixed-interval: send, wait `attempt_timeout`, resend. After
/// `max_attempts` silent intervals the session is answered with
/// [`Reply::Timeout`], so no session outlives
/// [`RetryPolicy::deadline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Upper bound on the time spent waiting for one reply.
    pub fn deadline(&self) -> Duration {
        self.attempt_timeout * u32::from(self.max_attempts)
    }
}

/// Where requests are re-emitted, as given on the command line.
///
/// Resolved per session rather than once at startup so a KDC whose address
/// changes is picked up without restarting the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} resolved to no addresses", self.host),
                )
            })
    }
}

impl std::str::FromStr for Destination {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SetupError::Destination {
            destination: s.to_string(),
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() || port == 0 {
            return Err(invalid());
        }

        Ok(Destination {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Remote relay settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Loopback TCP port the tunnel forwards to.
    pub listen_port: u16,
    /// `host:port` of the real datagram service.
    pub destination: String,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen_port: 18889,
            destination: "localhost:88".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct RemoteRelay {
    listener: TcpListener,
    destination: Arc<Destination>,
    retry: RetryPolicy,
}

impl RemoteRelay {
    /// Validate the destination and bind the stream listener.
    pub async fn bind(config: RemoteConfig) -> Result<Self, SetupError> {
        if config.retry.max_attempts == 0 {
            return Err(SetupError::NoAttempts);
        }
        let destination: Destination = config.destination.parse()?;
        let listener = udp_tunnel_net::bind_tcp_loopback(config.listen_port).await?;

        Ok(Self {
            listener,
            destination: Arc::new(destination),
            retry: config.retry,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve sessions until `graceful` is cancelled.
    pub async fn run(self, graceful: Graceful) -> std::io::Result<()> {
        tracing::info!(
            "Remote relay listening on {} for {} (attempt timeout {:?}, {} attempts)",
            self.listener.local_addr()?,
            self.destination,
            self.retry.attempt_timeout,
            self.retry.max_attempts,
        );

        loop {
            tokio::select! {
                _ = graceful.cancelled() => {
                    tracing::info!("Remote relay shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {e}");
                            continue;
                        }
                    };

                    let destination = self.destination.clone();
                    let retry = self.retry;
                    graceful.spawn(async move {
                        if let Err(e) = handle_session(stream, &destination, retry).await {
                            tracing::warn!("Session from {peer} failed: {e}");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

async fn handle_session(
    mut stream: TcpStream,
    destination: &Destination,
    retry: RetryPolicy,
) -> Result<(), FrameError> {
    let request = udp_tunnel_net::read_request(&mut stream).await?;
    tracing::debug!("Relaying {} byte request to {destination}", request.len());

    let reply = query(destination, &request, retry).await;
    match &reply {
        Reply::Datagram(payload) => {
            tracing::debug!("Destination replied with {} bytes", payload.len());
        }
        Reply::Timeout { attempts } => {
            tracing::warn!("No reply from {destination} after {attempts} attempts");
        }
        Reply::Unreachable => {}
    }

    udp_tunnel_net::write_reply(&mut stream, &reply).await
}

/// Send `request` to `destination` until it answers or `retry` runs out.
pub async fn query(destination: &Destination, request: &[u8], retry: RetryPolicy) -> Reply {
    let socket = match connect_udp(destination).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("Destination {destination} unreachable: {e}");
            return Reply::Unreachable;
        }
    };

    // One spare byte so an oversized datagram shows up as one.
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    let mut sent_any = false;

    for attempt in 1..=retry.max_attempts {
        match socket.send(request).await {
            Ok(_) => sent_any = true,
            // A refusal from an earlier attempt can surface here; the
            // destination may still come up before the next attempt.
            Err(e) => tracing::debug!("Attempt {attempt} to {destination} not sent: {e}"),
        }

        let deadline = tokio::time::Instant::now() + retry.attempt_timeout;
        if let Some(len) = recv_until(&socket, &mut buf, deadline).await {
            if attempt > 1 {
                tracing::debug!("{destination} answered on attempt {attempt}");
            }
            buf.truncate(len);
            return Reply::Datagram(buf);
        }
    }

    if !sent_any {
        tracing::warn!("Could not send to {destination}");
        return Reply::Unreachable;
    }

    Reply::Timeout {
        attempts: retry.max_attempts,
    }
}

async fn connect_udp(destination: &Destination) -> std::io::Result<UdpSocket> {
    let target = destination.resolve().await?;
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Wait for one datagram until `deadline`.
///
/// Receive errors (typically an ICMP refusal reported on the connected
/// socket) do not end the wait early, and neither do datagrams too large to
/// relay: those would reach the client cut short.
async fn recv_until(
    socket: &UdpSocket,
    buf: &mut [u8],
    deadline: tokio::time::Instant,
) -> Option<usize> {
    loop {
        match tokio::time::timeout_at(deadline, socket.recv(buf)).await {
            Ok(Ok(len)) if len > MAX_DATAGRAM_SIZE => {
                tracing::warn!("Ignoring reply larger than {MAX_DATAGRAM_SIZE} bytes");
            }
            Ok(Ok(len)) => return Some(len),
            Ok(Err(e)) => tracing::trace!("recv error while waiting for reply: {e}"),
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: u8) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(50),
            max_attempts,
        }
    }

    /// Destination that ignores the first `silent` datagrams and answers
    /// the rest with `reply`.
    async fn flaky_destination(
        silent: usize,
        reply: &'static [u8],
    ) -> (Destination, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                if counter.fetch_add(1, Ordering::SeqCst) >= silent {
                    socket.send_to(reply, from).await.unwrap();
                }
            }
        });

        (addr.to_string().parse().unwrap(), seen)
    }

    #[test]
    fn test_parse_destination() {
        let dest: Destination = "kdc.example.org:88".parse().unwrap();
        assert_eq!(dest.host(), "kdc.example.org");
        assert_eq!(dest.port(), 88);
        assert_eq!(dest.to_string(), "kdc.example.org:88");
    }

    #[test]
    fn test_parse_ipv6_destination() {
        let dest: Destination = "[::1]:88".parse().unwrap();
        assert_eq!(dest.host(), "::1");
        assert_eq!(dest.to_string(), "[::1]:88");
    }

    #[test]
    fn test_parse_invalid_destination() {
        for input in ["kdc.example.org", "kdc.example.org:", ":88", "kdc:0", "kdc:kerberos"] {
            assert!(
                matches!(input.parse::<Destination>(), Err(SetupError::Destination { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_policy_deadline() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempt_timeout, Duration::from_secs(1));
        assert_eq!(policy.deadline(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_reply_wins() {
        let (dest, seen) = flaky_destination(0, b"\xAA\xBB").await;

        let reply = query(&dest, b"\x01\x02\x03", fast_policy(5)).await;

        assert_eq!(reply, Reply::Datagram(b"\xAA\xBB".to_vec()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reply_after_silent_attempts() {
        let (dest, seen) = flaky_destination(2, b"late").await;

        let reply = query(&dest, b"ping", fast_policy(5)).await;

        assert_eq!(reply, Reply::Datagram(b"late".to_vec()));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_silent_destination_times_out_within_deadline() {
        let (dest, seen) = flaky_destination(usize::MAX, b"never").await;
        let policy = fast_policy(3);

        let started = std::time::Instant::now();
        let reply = query(&dest, b"ping", policy).await;
        let elapsed = started.elapsed();

        assert_eq!(reply, Reply::Timeout { attempts: 3 });
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(elapsed >= policy.deadline());
        assert!(elapsed < policy.deadline() + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_session_over_stream() {
        let (dest, _) = flaky_destination(0, b"\xAA\xBB").await;
        let relay = RemoteRelay::bind(RemoteConfig {
            listen_port: 0,
            destination: dest.to_string(),
            retry: fast_policy(3),
        })
        .await
        .unwrap();
        let addr = relay.local_addr().unwrap();

        let graceful = Graceful::new();
        tokio::spawn(relay.run(graceful.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        udp_tunnel_net::write_request(&mut stream, b"\x01\x02\x03").await.unwrap();
        let reply = udp_tunnel_net::read_reply(&mut stream).await.unwrap();

        assert_eq!(reply, Reply::Datagram(b"\xAA\xBB".to_vec()));
        graceful.cancel();
    }

    #[tokio::test]
    async fn test_oversized_reply_is_not_relayed() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest: Destination = socket.local_addr().unwrap().to_string().parse().unwrap();

        // Too large on the first attempt, a proper reply on the second.
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&[0x42; 1600], from).await.unwrap();
            let (_, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(b"fits", from).await.unwrap();
        });

        let reply = query(&dest, b"ping", fast_policy(3)).await;
        assert_eq!(reply, Reply::Datagram(b"fits".to_vec()));
    }

    #[tokio::test]
    async fn test_only_oversized_replies_time_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest: Destination = socket.local_addr().unwrap().to_string().parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&[0x42; MAX_DATAGRAM_SIZE + 100], from).await.unwrap();
            }
        });

        let reply = query(&dest, b"ping", fast_policy(2)).await;
        assert_eq!(reply, Reply::Timeout { attempts: 2 });
    }

    #[tokio::test]
    async fn test_bind_rejects_zero_attempts() {
        let result = RemoteRelay::bind(RemoteConfig {
            listen_port: 0,
            retry: fast_policy(0),
            ..RemoteConfig::default()
        })
        .await;

        assert!(matches!(result, Err(SetupError::NoAttempts)));
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_destination() {
        let result = RemoteRelay::bind(RemoteConfig {
            listen_port: 0,
            destination: "no-port".to_string(),
            retry: RetryPolicy::default(),
        })
        .await;

        assert!(matches!(result, Err(SetupError::Destination { .. })));
    }
}

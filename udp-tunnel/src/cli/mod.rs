//! Command line front ends for the relays

use std::future::Future;
use std::time::Duration;

use udp_tunnel::{LocalConfig, RetryPolicy, Signals};
use udp_tunnel_net::Graceful;

pub mod connect;
pub mod local;
pub mod remote;

/// How long in-flight sessions get once a standalone relay is told to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Log to stderr. On the far host stderr is what `ssh` carries back.
pub fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

/// Options of the datagram side, shared by `connect` and `local`.
#[derive(clap::Args, Debug)]
pub struct LocalArgs {
    /// Loopback UDP port clients send requests to
    #[arg(long, default_value_t = 18888, env = "UDP_TUNNEL_LISTEN_PORT")]
    pub listen_port: u16,

    /// Loopback TCP port of the tunnel's local forward
    #[arg(long, default_value_t = 18889, env = "UDP_TUNNEL_FORWARD_PORT")]
    pub forward_port: u16,

    /// Give up on one request after this many milliseconds
    #[arg(long, default_value_t = 10_000, env = "UDP_TUNNEL_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Requests relayed at the same time
    #[arg(long, default_value_t = 64, env = "UDP_TUNNEL_MAX_IN_FLIGHT")]
    pub max_in_flight: usize,
}

impl LocalArgs {
    pub fn config(&self) -> LocalConfig {
        LocalConfig {
            listen_port: self.listen_port,
            forward_port: self.forward_port,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_in_flight: self.max_in_flight,
        }
    }
}

/// Retry options of the remote relay. `connect` forwards them to the far host.
#[derive(clap::Args, Debug)]
pub struct RetryArgs {
    /// Wait this long for a reply before resending the request
    #[arg(long, default_value_t = 1000, env = "UDP_TUNNEL_ATTEMPT_TIMEOUT_MS")]
    pub attempt_timeout_ms: u64,

    /// Send the request at most this many times
    #[arg(
        long,
        default_value_t = 5,
        value_parser = clap::value_parser!(u8).range(1..),
        env = "UDP_TUNNEL_MAX_ATTEMPTS"
    )]
    pub max_attempts: u8,
}

impl RetryArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Run a standalone relay until it fails or a termination signal arrives.
async fn serve_until_signal<F>(relay: F, graceful: Graceful) -> eyre::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    use eyre::WrapErr;

    let mut signals = Signals::register().wrap_err("failed to register signal handlers")?;

    let result = tokio::select! {
        result = relay => result.wrap_err("relay stopped"),
        termination = signals.recv() => {
            tracing::info!("Received {termination}, shutting down");
            Ok(())
        }
    };

    graceful.shutdown(SHUTDOWN_GRACE).await;
    result
}

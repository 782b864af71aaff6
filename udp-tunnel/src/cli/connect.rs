use std::time::Duration;

use eyre::WrapErr;
use udp_tunnel::{Lifecycle, LocalConfig, LocalRelay, Signals, SshTunnel, TunnelConfig};
use udp_tunnel_net::Graceful;

use super::{LocalArgs, RetryArgs};

/// Room for the tunnel round trip on top of the remote retry deadline.
const TUNNEL_SLACK: Duration = Duration::from_secs(2);

#[derive(clap::Args, Debug)]
pub struct ConnectArgs {
    /// Host to tunnel through, as understood by ssh (`user@host`, an alias, ...)
    pub host: String,

    #[command(flatten)]
    pub local: LocalArgs,

    /// TCP port the remote relay listens on, on the far host's loopback
    #[arg(long, default_value_t = 18889, env = "UDP_TUNNEL_REMOTE_PORT")]
    pub remote_port: u16,

    /// Where the remote relay sends requests, as host:port seen from the far host
    #[arg(long, default_value = "localhost:88", env = "UDP_TUNNEL_DESTINATION")]
    pub destination: String,

    /// udp-tunnel binary on the far host
    #[arg(long, default_value = "udp-tunnel", env = "UDP_TUNNEL_REMOTE_PROGRAM")]
    pub remote_program: String,

    /// ssh client to run
    #[arg(long, default_value = "ssh", env = "UDP_TUNNEL_SSH")]
    pub ssh: String,

    /// Extra argument for every ssh invocation, before the host (repeatable)
    #[arg(long = "ssh-arg", allow_hyphen_values = true)]
    pub ssh_args: Vec<String>,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Give up on stopping the remote relay after this many milliseconds
    #[arg(long, default_value_t = 10_000, env = "UDP_TUNNEL_KILL_TIMEOUT_MS")]
    pub kill_timeout_ms: u64,
}

impl ConnectArgs {
    /// Local settings, with the request timeout raised if needed so the
    /// remote side can finish every attempt and report back.
    fn local_config(&self) -> LocalConfig {
        let mut config = self.local.config();
        let floor = self.retry.policy().deadline() + TUNNEL_SLACK;
        if config.request_timeout < floor {
            tracing::info!(
                "Raising request timeout from {:?} to {floor:?} to cover remote retries",
                config.request_timeout
            );
            config.request_timeout = floor;
        }
        config
    }

    fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            ssh_program: self.ssh.clone(),
            ssh_args: self.ssh_args.clone(),
            host: self.host.clone(),
            forward_port: self.local.forward_port,
            remote_port: self.remote_port,
            destination: self.destination.clone(),
            remote_program: self.remote_program.clone(),
            retry: self.retry.policy(),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
        }
    }
}

pub async fn run(args: ConnectArgs) -> eyre::Result<()> {
    let mut signals = Signals::register().wrap_err("failed to register signal handlers")?;

    // Bind before ssh starts: a taken port then needs no remote cleanup.
    let relay = LocalRelay::bind(args.local_config())
        .await
        .wrap_err("failed to start local relay")?;

    let (tunnel, mut process) =
        SshTunnel::start(args.tunnel_config()).wrap_err("failed to start ssh tunnel")?;
    tracing::info!(
        "Tunnel to {} started (ssh pid {:?}), relaying to {}",
        args.host,
        process.id(),
        args.destination
    );

    let graceful = Graceful::new();
    let lifecycle = Lifecycle::new(tunnel, graceful.clone());
    let outcome = lifecycle
        .run(relay.run(graceful), process.wait(), signals.recv())
        .await;

    process.stop().await;

    let termination = outcome.wrap_err("tunnel stopped")?;
    tracing::info!("Stopped after {termination}");
    Ok(())
}

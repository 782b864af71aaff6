use eyre::WrapErr;
use udp_tunnel::{RemoteConfig, RemoteRelay};
use udp_tunnel_net::Graceful;

use super::RetryArgs;

#[derive(clap::Args, Debug)]
pub struct RemoteArgs {
    /// Loopback TCP port the tunnel forwards to
    #[arg(long, default_value_t = 18889, env = "UDP_TUNNEL_REMOTE_PORT")]
    pub listen_port: u16,

    /// Where requests are sent, as host:port
    #[arg(long, default_value = "localhost:88", env = "UDP_TUNNEL_DESTINATION")]
    pub destination: String,

    #[command(flatten)]
    pub retry: RetryArgs,
}

pub async fn run(args: RemoteArgs) -> eyre::Result<()> {
    let relay = RemoteRelay::bind(RemoteConfig {
        listen_port: args.listen_port,
        destination: args.destination,
        retry: args.retry.policy(),
    })
    .await
    .wrap_err("failed to start remote relay")?;

    let graceful = Graceful::new();
    super::serve_until_signal(relay.run(graceful.clone()), graceful).await
}

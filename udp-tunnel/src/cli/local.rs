use eyre::WrapErr;
use udp_tunnel::LocalRelay;
use udp_tunnel_net::Graceful;

use super::LocalArgs;

pub async fn run(args: LocalArgs) -> eyre::Result<()> {
    let relay = LocalRelay::bind(args.config())
        .await
        .wrap_err("failed to start local relay")?;

    let graceful = Graceful::new();
    super::serve_until_signal(relay.run(graceful.clone()), graceful).await
}
